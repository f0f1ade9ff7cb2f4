use super::*;
use crate::error::Result;

#[test]
fn test_layout_rejects_bad_parameters() {
    assert_eq!(
        ChunkLayout::new(0, 16, 4, 2).err(),
        Some(Error::ErrInvalidArgument("total_size"))
    );
    assert_eq!(
        ChunkLayout::new(40, 0, 4, 2).err(),
        Some(Error::ErrInvalidArgument("chunk_size"))
    );
    assert_eq!(
        ChunkLayout::new(40, 65537, 4, 2).err(),
        Some(Error::ErrInvalidArgument("chunk_size"))
    );
    assert_eq!(
        ChunkLayout::new(40, 16, 0, 2).err(),
        Some(Error::ErrInvalidArgument("fec parameters"))
    );
    assert_eq!(
        ChunkLayout::new(40, 16, 224, 32).err(),
        Some(Error::ErrInvalidArgument("fec parameters"))
    );
}

#[test]
fn test_layout_rejects_oversized_object() {
    // 2^32 data chunks of 1 byte exceed the id space once parity is added.
    let result = ChunkLayout::new(1 << 32, 1, 223, 32);
    assert_eq!(result.err(), Some(Error::ErrObjectTooLarge));
}

#[test]
fn test_layout_forty_byte_object() -> Result<()> {
    // 40 bytes / 16-byte chunks -> 3 data chunks (16, 16, 8) + 2 parity.
    let layout = ChunkLayout::new(40, 16, 4, 2)?;
    assert_eq!(layout.data_chunks, 3);
    assert_eq!(layout.blocks, 1);
    assert_eq!(layout.total_chunks, 5);

    let span = layout.block_span(0);
    assert_eq!(span.data_start_id, 0);
    assert_eq!(span.data_count, 3);
    assert_eq!(span.parity_start_id, 3);
    assert_eq!(span.parity_count, 2);
    assert_eq!(span.decode_threshold(), 3);

    assert_eq!(layout.chunk_len(0), 16);
    assert_eq!(layout.chunk_len(1), 16);
    assert_eq!(layout.chunk_len(2), 8);
    assert_eq!(layout.chunk_len(3), 16);
    assert_eq!(layout.chunk_len(4), 16);
    assert!(!layout.is_parity(2));
    assert!(layout.is_parity(3));
    assert!(layout.is_parity(4));
    Ok(())
}

#[test]
fn test_layout_one_mib_object() -> Result<()> {
    // 1 MiB / 64 KiB chunks with defaults -> one block, 16 data + 32 parity.
    let layout = ChunkLayout::new(1 << 20, 65536, 223, 32)?;
    assert_eq!(layout.data_chunks, 16);
    assert_eq!(layout.blocks, 1);
    assert_eq!(layout.total_chunks, 48);
    assert_eq!(layout.block_span(0).decode_threshold(), 16);
    Ok(())
}

#[test]
fn test_layout_multi_block_geometry() -> Result<()> {
    // 10 data chunks, K=4, R=2 -> blocks of (4, 4, 2) data chunks.
    let layout = ChunkLayout::new(10 * 8, 8, 4, 2)?;
    assert_eq!(layout.data_chunks, 10);
    assert_eq!(layout.blocks, 3);
    assert_eq!(layout.total_chunks, 16);

    let s0 = layout.block_span(0);
    assert_eq!((s0.data_start_id, s0.data_count, s0.parity_start_id), (0, 4, 4));
    let s1 = layout.block_span(1);
    assert_eq!((s1.data_start_id, s1.data_count, s1.parity_start_id), (6, 4, 10));
    let s2 = layout.block_span(2);
    assert_eq!((s2.data_start_id, s2.data_count, s2.parity_start_id), (12, 2, 14));
    assert_eq!(s2.decode_threshold(), 2);

    // Ids map back onto blocks and data ordinals.
    for block in 0..layout.blocks {
        let span = layout.block_span(block);
        for id in span.data_start_id..span.end_id() {
            assert_eq!(layout.block_of(id), block);
        }
        for i in 0..span.data_count {
            let id = span.data_start_id + i;
            assert_eq!(layout.data_index(id), span.first_data_index + i);
            assert_eq!(layout.data_id_of_index(span.first_data_index + i), id);
        }
    }

    // Final data chunk of the object is full here (80 = 10 * 8).
    assert_eq!(layout.chunk_len(13), 8);
    Ok(())
}

fn sample_object(len: usize) -> Bytes {
    Bytes::from((0..len).map(|i| (i * 31 % 251) as u8).collect::<Vec<u8>>())
}

#[test]
fn test_parity_round_trip_with_losses() -> Result<()> {
    let layout = ChunkLayout::new(40, 16, 4, 2)?;
    let object = sample_object(40);
    let rs = new_block_coder(4, 2)?.expect("parity configured");

    let data_shards: Vec<Vec<u8>> = (0..4)
        .map(|i| padded_data_shard(&object, &layout, i))
        .collect();
    let parity = encode_block_parity(&rs, data_shards.clone(), 16, 2)?;
    assert_eq!(parity.len(), 2);
    assert!(parity.iter().all(|p| p.len() == 16));

    // Drop two data shards, keep one data + both parity; pad shard 3 is known.
    let mut shards: Vec<Option<Vec<u8>>> = vec![
        None,
        None,
        Some(data_shards[2].clone()),
        Some(data_shards[3].clone()),
        Some(parity[0].clone()),
        Some(parity[1].clone()),
    ];
    reconstruct_block_data(&rs, &mut shards)?;

    for i in 0..4 {
        assert_eq!(
            shards[i].as_deref(),
            Some(&data_shards[i][..]),
            "data shard {i} must be recovered byte-for-byte"
        );
    }
    Ok(())
}

#[test]
fn test_reconstruction_is_deterministic() -> Result<()> {
    let layout = ChunkLayout::new(1000, 100, 5, 3)?;
    let object = sample_object(1000);
    let rs = new_block_coder(5, 3)?.expect("parity configured");

    let data: Vec<Vec<u8>> = (0..5)
        .map(|i| padded_data_shard(&object, &layout, i))
        .collect();
    let parity = encode_block_parity(&rs, data.clone(), 100, 3)?;

    for _ in 0..2 {
        let mut shards: Vec<Option<Vec<u8>>> = vec![
            Some(data[0].clone()),
            None,
            None,
            None,
            Some(data[4].clone()),
            Some(parity[0].clone()),
            Some(parity[1].clone()),
            Some(parity[2].clone()),
        ];
        reconstruct_block_data(&rs, &mut shards)?;
        for i in 0..5 {
            assert_eq!(shards[i].as_deref(), Some(&data[i][..]));
        }
    }
    Ok(())
}

#[test]
fn test_reconstruction_fails_below_threshold() -> Result<()> {
    let rs = new_block_coder(4, 2)?.expect("parity configured");
    let object = sample_object(64);
    let layout = ChunkLayout::new(64, 16, 4, 2)?;

    let data: Vec<Vec<u8>> = (0..4)
        .map(|i| padded_data_shard(&object, &layout, i))
        .collect();
    let parity = encode_block_parity(&rs, data, 16, 2)?;

    // Only 3 of 6 shards present; K=4 cannot be met.
    let mut shards: Vec<Option<Vec<u8>>> = vec![
        None,
        None,
        None,
        Some(padded_data_shard(&object, &layout, 3)),
        Some(parity[0].clone()),
        Some(parity[1].clone()),
    ];
    assert_eq!(
        reconstruct_block_data(&rs, &mut shards).err(),
        Some(Error::ErrFecDecodeFailed)
    );
    Ok(())
}

#[test]
fn test_no_parity_layout() -> Result<()> {
    assert!(new_block_coder(4, 0)?.is_none());
    let layout = ChunkLayout::new(100, 10, 4, 0)?;
    assert_eq!(layout.total_chunks, layout.data_chunks);
    assert!(!layout.is_parity(9));
    Ok(())
}

#[test]
fn test_data_chunk_slicing() -> Result<()> {
    let layout = ChunkLayout::new(40, 16, 4, 2)?;
    let object = sample_object(40);
    assert_eq!(data_chunk(&object, &layout, 0), object.slice(0..16));
    assert_eq!(data_chunk(&object, &layout, 2), object.slice(32..40));

    // The pad shard beyond the object is all zeros.
    let pad = padded_data_shard(&object, &layout, 3);
    assert!(pad.iter().all(|&b| b == 0));
    Ok(())
}
