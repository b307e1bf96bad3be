//! 单元格分桶属性测试
//!
//! - 外部单元格的块/子块只由网格坐标决定（向下取整除以 32 / 8）
//! - 任意单元格集合写出的字节数等于计算出的大小，重新加载后写出相同字节

mod common;

use common::*;
use esp_groups::group::{BlockLabel, BucketKey};
use esp_groups::{CellBlock, Container, FormId, InteriorCellContainer, Plugin, TopGroup, WorldGroup};
use proptest::prelude::*;
use std::collections::BTreeSet;

fn reload(group_bytes: Vec<u8>) -> Plugin {
    let data = plugin_bytes(&[GAME_MASTER], &[group_bytes]);
    Plugin::from_bytes("Cells.esp", &data, factory(), true).unwrap()
}

proptest! {
    #[test]
    fn exterior_bucket_follows_grid(x in -2000i32..2000, y in -2000i32..2000, fid in 1u32..0x00FF_FFFF) {
        let block = CellBlock::new(Box::new(exterior_cell(fid, x, y)), 0, factory(), "Cells.esp");
        let again = CellBlock::new(Box::new(exterior_cell(fid ^ 1, x, y)), 0, factory(), "Cells.esp");
        let key = block.bucket_key();

        prop_assert_eq!(key, again.bucket_key());
        prop_assert_eq!(
            key,
            BucketKey {
                block: BlockLabel::exterior(x.div_euclid(32), y.div_euclid(32)),
                sub_block: BlockLabel::exterior(x.div_euclid(8), y.div_euclid(8)),
            }
        );
    }

    #[test]
    fn interior_bucket_follows_object_id(id in 0u32..0x00FF_FFFF) {
        let block = CellBlock::new(Box::new(interior_cell(0x0100_0000 | id)), 0, factory(), "Cells.esp");
        let base = id as i32;
        prop_assert_eq!(
            block.bucket_key(),
            BucketKey {
                block: BlockLabel::Interior(base % 10),
                sub_block: BlockLabel::Interior(base % 100 / 10),
            }
        );
    }

    #[test]
    fn interior_cells_dump_consistently(ids in prop::collection::btree_set(1u32..5000, 1..40)) {
        let mut cells = InteriorCellContainer::new(0, factory(), "Cells.esp");
        for id in &ids {
            cells.set_cell(Box::new(interior_cell(0x0100_0000 | id))).unwrap();
        }
        let mut out = Vec::new();
        cells.dump(&mut out).unwrap();
        prop_assert_eq!(out.len() as u32, cells.get_size());

        let plugin = reload(out.clone());
        let reloaded = match plugin.top_group(b"CELL") {
            Some(TopGroup::InteriorCells(reloaded)) => reloaded,
            _ => panic!("CELL 组缺失"),
        };
        prop_assert_eq!(reloaded.cell_blocks().len(), ids.len());
        prop_assert_eq!(reloaded.get_num_records(true).unwrap(), cells.get_num_records(true).unwrap());
        let mut again = Vec::new();
        reloaded.dump(&mut again).unwrap();
        prop_assert_eq!(again, out);
    }

    #[test]
    fn exterior_cells_dump_consistently(coords in prop::collection::btree_set((-100i32..100, -100i32..100), 1..30)) {
        let world_fid = FormId::Short(0x0100_0800);
        let mut worlds = WorldGroup::new(0, factory(), "Cells.esp");
        worlds.set_world(Box::new(record(*b"WRLD", 0x0100_0800, &[]))).unwrap();
        let world = worlds.world_block_mut(&world_fid).unwrap().unwrap();
        for (i, (x, y)) in coords.iter().enumerate() {
            world.set_cell(Box::new(exterior_cell(0x0100_1000 + i as u32, *x, *y))).unwrap();
        }

        let mut out = Vec::new();
        worlds.dump(&mut out).unwrap();
        prop_assert_eq!(out.len() as u32, worlds.get_size());

        let plugin = reload(out.clone());
        let reloaded = match plugin.top_group(b"WRLD") {
            Some(TopGroup::Worlds(reloaded)) => reloaded,
            _ => panic!("WRLD 组缺失"),
        };
        let block = reloaded.world_block(&world_fid).unwrap();
        let cells = &block.children().unwrap().cells;
        prop_assert_eq!(cells.blocks.len(), coords.len());

        // 重新加载后单元格按桶排列
        let keys: Vec<BucketKey> = cells.blocks.iter().map(|b| b.bucket_key()).collect();
        let mut sorted = keys.clone();
        sorted.sort();
        prop_assert_eq!(&keys, &sorted);
        let used: BTreeSet<BlockLabel> = keys.iter().map(|k| k.block).collect();
        prop_assert_eq!(used.len(), cells.used_blocks().len());

        let mut again = Vec::new();
        reloaded.dump(&mut again).unwrap();
        prop_assert_eq!(again, out);
    }
}
