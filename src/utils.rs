use thiserror::Error;
use crate::form_id::FormId;

/// 自定义错误类型
#[derive(Error, Debug)]
pub enum EspError {
    /// 插件结构错误（致命，加载中止）
    #[error("{file}: {message}")]
    Format { file: String, message: String },

    /// 单值子记录的 FormID 与目标不一致
    #[error("Fids don't match! {dest}, {src}")]
    IdentityMismatch { dest: FormId, src: FormId },

    #[error("{file}: master {master} is not available")]
    MissingMaster { file: String, master: String },

    #[error("FormID {0} is still in long form and cannot be written")]
    UnconvertedFormId(FormId),

    #[error("Unsupported record type: {0}")]
    UnsupportedRecordType(String),

    #[error("Cannot merge a {src} group into a {dest} group")]
    ContainerMismatch { dest: String, src: String },

    #[error("Compression error: {0}")]
    CompressionError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),
}

impl EspError {
    /// 构造格式错误
    pub fn format(file: &str, message: impl Into<String>) -> Self {
        EspError::Format {
            file: file.to_string(),
            message: message.into(),
        }
    }

    /// 是否为格式错误
    pub fn is_format(&self) -> bool {
        matches!(self, EspError::Format { .. })
    }
}

pub type Result<T> = std::result::Result<T, EspError>;

/// 签名转可读字符串
pub fn sig_str(sig: &[u8; 4]) -> String {
    String::from_utf8_lossy(sig).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_error_message() {
        let err = EspError::format("Test.esp", "Unexpected REFR record in NPC_ group.");
        assert!(err.is_format());
        assert_eq!(err.to_string(), "Test.esp: Unexpected REFR record in NPC_ group.");
    }

    #[test]
    fn test_sig_str() {
        assert_eq!(sig_str(b"NPC_"), "NPC_");
    }
}
