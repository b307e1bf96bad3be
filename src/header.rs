//! 组头部与记录头部
//!
//! 两种头部都是 24 字节：
//! - 组头部：`GRUP`、大小（含头部）、标签、组类型、时间戳、附加字段
//! - 记录头部：签名、数据大小（不含头部）、flags1、FormID、flags2、附加字段

use crate::datatypes::{read_i32, read_u32, write_i32, write_u32};
use std::io::{Read, Write};

/// 头部大小（所有容器共享）
pub const HEADER_SIZE: u32 = 24;

/// 4字节签名
pub type Signature = [u8; 4];

pub const GRUP: Signature = *b"GRUP";

/// 组类型
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupType {
    /// 顶级组
    Top,
    /// 世界子组
    WorldChildren,
    /// 内部单元格块
    InteriorBlock,
    /// 内部单元格子块
    InteriorSubBlock,
    /// 外部单元格块
    ExteriorBlock,
    /// 外部单元格子块
    ExteriorSubBlock,
    /// 单元格子组
    CellChildren,
    /// 对话子组
    TopicChildren,
    /// 持久引用
    CellPersistent,
    /// 临时引用
    CellTemporary,
    /// 远景引用
    CellDistant,
    /// 未知类型
    Unknown(i32),
}

impl GroupType {
    /// 转换为i32值
    pub fn to_i32(&self) -> i32 {
        match self {
            GroupType::Top => 0,
            GroupType::WorldChildren => 1,
            GroupType::InteriorBlock => 2,
            GroupType::InteriorSubBlock => 3,
            GroupType::ExteriorBlock => 4,
            GroupType::ExteriorSubBlock => 5,
            GroupType::CellChildren => 6,
            GroupType::TopicChildren => 7,
            GroupType::CellPersistent => 8,
            GroupType::CellTemporary => 9,
            GroupType::CellDistant => 10,
            GroupType::Unknown(value) => *value,
        }
    }
}

impl From<i32> for GroupType {
    fn from(value: i32) -> Self {
        match value {
            0 => GroupType::Top,
            1 => GroupType::WorldChildren,
            2 => GroupType::InteriorBlock,
            3 => GroupType::InteriorSubBlock,
            4 => GroupType::ExteriorBlock,
            5 => GroupType::ExteriorSubBlock,
            6 => GroupType::CellChildren,
            7 => GroupType::TopicChildren,
            8 => GroupType::CellPersistent,
            9 => GroupType::CellTemporary,
            10 => GroupType::CellDistant,
            _ => GroupType::Unknown(value),
        }
    }
}

/// 组头部
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GroupHeader {
    /// 组大小(包含头部24字节)
    pub size: u32,
    /// 标签（含义随组类型变化：签名、FormID 或坐标）
    pub label: [u8; 4],
    /// 组类型
    pub group_type: i32,
    /// 时间戳
    pub stamp: u32,
    /// 附加字段
    pub extra: u32,
}

impl GroupHeader {
    pub fn new(size: u32, label: [u8; 4], group_type: GroupType, stamp: u32) -> Self {
        GroupHeader {
            size,
            label,
            group_type: group_type.to_i32(),
            stamp,
            extra: 0,
        }
    }

    /// 顶级组头部，标签为记录签名
    pub fn top(label: Signature, stamp: u32) -> Self {
        Self::new(HEADER_SIZE, label, GroupType::Top, stamp)
    }

    /// 以 FormID 为标签的组头部
    pub fn with_fid(size: u32, fid: u32, group_type: GroupType, stamp: u32) -> Self {
        Self::new(size, fid.to_le_bytes(), group_type, stamp)
    }

    /// 把非组记录头部当作组头部使用：flags1/fid/flags2 依次作为 标签/组类型/时间戳
    pub fn from_record_header(header: &RecordHeader) -> Self {
        GroupHeader {
            size: header.size,
            label: header.flags1.to_le_bytes(),
            group_type: header.fid as i32,
            stamp: header.flags2,
            extra: header.extra,
        }
    }

    pub fn group_type(&self) -> GroupType {
        GroupType::from(self.group_type)
    }

    pub fn label_u32(&self) -> u32 {
        u32::from_le_bytes(self.label)
    }

    /// 标签解读为两个 i16（外部块：网格 Y, X）
    pub fn label_coords(&self) -> (i16, i16) {
        let low = i16::from_le_bytes([self.label[0], self.label[1]]);
        let high = i16::from_le_bytes([self.label[2], self.label[3]]);
        (low, high)
    }

    /// 数据部分大小（不含头部）
    pub fn payload_size(&self) -> u32 {
        self.size.saturating_sub(HEADER_SIZE)
    }

    /// 签名之后的 20 字节
    fn read_body<R: Read + ?Sized>(reader: &mut R) -> Result<Self, std::io::Error> {
        let size = read_u32(reader)?;
        let mut label = [0u8; 4];
        reader.read_exact(&mut label)?;
        let group_type = read_i32(reader)?;
        let stamp = read_u32(reader)?;
        let extra = read_u32(reader)?;
        Ok(GroupHeader {
            size,
            label,
            group_type,
            stamp,
            extra,
        })
    }

    /// 写入组头部
    pub fn write(&self, out: &mut dyn Write) -> Result<(), std::io::Error> {
        out.write_all(&GRUP)?;
        write_u32(out, self.size)?;
        out.write_all(&self.label)?;
        write_i32(out, self.group_type)?;
        write_u32(out, self.stamp)?;
        write_u32(out, self.extra)
    }
}

/// 记录头部
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordHeader {
    /// 记录类型
    pub signature: Signature,
    /// 数据大小（不含头部）
    pub size: u32,
    /// 标志位
    pub flags1: u32,
    /// FormID（短格式）
    pub fid: u32,
    /// 时间戳 + 版本控制信息
    pub flags2: u32,
    /// 内部版本 + 未知字段
    pub extra: u32,
}

impl RecordHeader {
    pub fn new(signature: Signature, size: u32, flags1: u32, fid: u32) -> Self {
        RecordHeader {
            signature,
            size,
            flags1,
            fid,
            flags2: 0,
            extra: 0,
        }
    }

    fn read_body<R: Read + ?Sized>(signature: Signature, reader: &mut R) -> Result<Self, std::io::Error> {
        let size = read_u32(reader)?;
        let flags1 = read_u32(reader)?;
        let fid = read_u32(reader)?;
        let flags2 = read_u32(reader)?;
        let extra = read_u32(reader)?;
        Ok(RecordHeader {
            signature,
            size,
            flags1,
            fid,
            flags2,
            extra,
        })
    }

    /// 写入记录头部
    pub fn write(&self, out: &mut dyn Write) -> Result<(), std::io::Error> {
        out.write_all(&self.signature)?;
        write_u32(out, self.size)?;
        write_u32(out, self.flags1)?;
        write_u32(out, self.fid)?;
        write_u32(out, self.flags2)?;
        write_u32(out, self.extra)
    }
}

/// 流中读取到的头部
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Header {
    Group(GroupHeader),
    Record(RecordHeader),
}

impl Header {
    pub fn read<R: Read + ?Sized>(reader: &mut R) -> Result<Self, std::io::Error> {
        let mut signature = [0u8; 4];
        reader.read_exact(&mut signature)?;
        if signature == GRUP {
            Ok(Header::Group(GroupHeader::read_body(reader)?))
        } else {
            Ok(Header::Record(RecordHeader::read_body(signature, reader)?))
        }
    }

    pub fn signature(&self) -> Signature {
        match self {
            Header::Group(_) => GRUP,
            Header::Record(header) => header.signature,
        }
    }

    /// 头部之后需要跳过的字节数
    pub fn payload_size(&self) -> u32 {
        match self {
            Header::Group(header) => header.payload_size(),
            Header::Record(header) => header.size,
        }
    }

    /// 按组头部解读（记录头部走 flags1/fid/flags2 重解释）
    pub fn as_group_header(&self) -> GroupHeader {
        match self {
            Header::Group(header) => *header,
            Header::Record(header) => GroupHeader::from_record_header(header),
        }
    }

    pub fn write(&self, out: &mut dyn Write) -> Result<(), std::io::Error> {
        match self {
            Header::Group(header) => header.write(out),
            Header::Record(header) => header.write(out),
        }
    }
}
