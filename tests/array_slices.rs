//! N-dimensional array scenarios (spec.md §8 S6-S8, P4, P9).

use blusc::array::Array;
use blusc::context::{CParams, DParams};

fn params() -> (CParams, DParams) {
    (CParams::default(), DParams::default())
}

#[test]
fn s6_set_slice_then_get_slice_only_touches_the_written_block() {
    let (c, d) = params();
    let mut arr = Array::zeros(&[100, 100], &[50, 50], &[25, 25], 4, c, d).unwrap();
    let ones = vec![1u8; 10 * 10 * 4];
    arr.set_slice_buffer(&ones, &[10, 10], &[40, 40], &[50, 50]).unwrap();

    let mut out = vec![0u8; 100 * 100 * 4];
    arr.get_slice_buffer(&[0, 0], &[100, 100], &mut out, &[100, 100]).unwrap();

    for r in 0..100i64 {
        for col in 0..100i64 {
            let off = ((r * 100 + col) as usize) * 4;
            let in_block = (40..50).contains(&r) && (40..50).contains(&col);
            let expected = if in_block { 1u8 } else { 0u8 };
            assert_eq!(out[off], expected, "row {r} col {col}");
        }
    }
}

#[test]
fn s7_resize_grows_keeping_old_region_and_zeroing_new_area() {
    let (c, d) = params();
    let mut arr = Array::zeros(&[100, 100], &[50, 50], &[25, 25], 4, c, d).unwrap();
    let ones = vec![1u8; 10 * 10 * 4];
    arr.set_slice_buffer(&ones, &[10, 10], &[40, 40], &[50, 50]).unwrap();

    arr.resize(&[100, 200], None).unwrap();
    assert_eq!(arr.shape(), &[100, 200]);

    let mut out = vec![0u8; 100 * 200 * 4];
    arr.get_slice_buffer(&[0, 0], &[100, 200], &mut out, &[100, 200]).unwrap();

    // new area (columns 100..200) is zero
    for r in 0..100i64 {
        let off = ((r * 200 + 150) as usize) * 4;
        assert_eq!(&out[off..off + 4], &[0, 0, 0, 0]);
    }
    // old written block survived the resize
    for r in 40..50i64 {
        for col in 40..50i64 {
            let off = ((r * 200 + col) as usize) * 4;
            assert_eq!(out[off], 1);
        }
    }
}

#[test]
fn s8_orthogonal_selection_returns_the_cartesian_product_gather() {
    let (c, d) = params();
    let shape = [10i64, 10i64];
    let mut arr = Array::zeros(&shape, &[5, 5], &[5, 5], 4, c, d).unwrap();
    let mut buf = vec![0u8; 100 * 4];
    for i in 0..100u32 {
        buf[i as usize * 4..i as usize * 4 + 4].copy_from_slice(&i.to_le_bytes());
    }
    arr.set_slice_buffer(&buf, &shape, &[0, 0], &shape).unwrap();

    // selection = [[90,10,50]/10, [0,99]] on a row-major i=row*10+col array
    // written above; using row selection [9,1,5] and column selection [0,9].
    let sel = vec![vec![9i64, 1, 5], vec![0i64, 9]];
    let out = arr.get_orthogonal_selection(&sel).unwrap();
    assert_eq!(out.len(), 3 * 2 * 4);

    let expect = |row: i64, col: i64| (row * 10 + col) as u32;
    for (ri, &row) in sel[0].iter().enumerate() {
        for (ci, &col) in sel[1].iter().enumerate() {
            let off = (ri * sel[1].len() + ci) * 4;
            let v = u32::from_le_bytes(out[off..off + 4].try_into().unwrap());
            assert_eq!(v, expect(row, col), "row={row} col={col}");
        }
    }
}

#[test]
fn p4_get_then_set_same_range_is_a_no_op() {
    let (c, d) = params();
    let mut arr = Array::zeros(&[40, 40], &[20, 20], &[10, 10], 4, c, d).unwrap();
    let pattern: Vec<u8> = (0..40 * 40 * 4).map(|i| (i % 256) as u8).collect();
    arr.set_slice_buffer(&pattern, &[40, 40], &[0, 0], &[40, 40]).unwrap();

    let mut out = vec![0u8; 12 * 12 * 4];
    arr.get_slice_buffer(&[8, 8], &[20, 20], &mut out, &[12, 12]).unwrap();
    arr.set_slice_buffer(&out, &[12, 12], &[8, 8], &[20, 20]).unwrap();

    let mut whole = vec![0u8; 40 * 40 * 4];
    arr.get_slice_buffer(&[0, 0], &[40, 40], &mut whole, &[40, 40]).unwrap();
    assert_eq!(whole, pattern);
}

#[test]
fn p9_resize_up_then_back_down_preserves_the_common_region() {
    let (c, d) = params();
    let mut arr = Array::zeros(&[40, 40], &[20, 20], &[10, 10], 4, c, d).unwrap();
    let pattern: Vec<u8> = (0..40 * 40 * 4).map(|i| (i % 256) as u8).collect();
    arr.set_slice_buffer(&pattern, &[40, 40], &[0, 0], &[40, 40]).unwrap();

    arr.resize(&[40, 80], None).unwrap();
    arr.resize(&[40, 40], None).unwrap();

    let mut out = vec![0u8; 40 * 40 * 4];
    arr.get_slice_buffer(&[0, 0], &[40, 40], &mut out, &[40, 40]).unwrap();
    assert_eq!(out, pattern);
}

#[test]
fn from_buffer_and_to_buffer_roundtrip() {
    let (c, d) = params();
    let src: Vec<u8> = (0..20 * 20 * 4).map(|i| (i % 200) as u8).collect();
    let arr = Array::from_buffer(&src, &[20, 20], &[10, 10], &[5, 5], 4, c, d).unwrap();
    let out = arr.to_buffer().unwrap();
    assert_eq!(out, src);
}

#[test]
fn full_array_decompresses_to_the_fill_value_everywhere() {
    let (c, d) = params();
    let fill = 7i32.to_le_bytes();
    let arr = Array::full(&[10, 10], &[5, 5], &[5, 5], 4, &fill, c, d).unwrap();
    let out = arr.to_buffer().unwrap();
    for chunk in out.chunks(4) {
        assert_eq!(i32::from_le_bytes(chunk.try_into().unwrap()), 7);
    }
}

#[test]
fn copy_with_same_geometry_preserves_contents() {
    let (c, d) = params();
    let src: Vec<u8> = (0..20 * 20 * 4).map(|i| (i % 200) as u8).collect();
    let arr = Array::from_buffer(&src, &[20, 20], &[10, 10], &[5, 5], 4, c, d).unwrap();
    let copied = arr.copy(&[10, 10], &[5, 5]).unwrap();
    assert_eq!(copied.to_buffer().unwrap(), src);
}

#[test]
fn append_insert_and_delete_along_one_axis() {
    let (c, d) = params();
    let mut arr = Array::zeros(&[4, 10], &[2, 5], &[2, 5], 4, c, d).unwrap();
    let row: Vec<u8> = (0..10u32).flat_map(|v| v.to_le_bytes()).collect();
    arr.set_slice_buffer(&row, &[1, 10], &[0, 0], &[1, 10]).unwrap();

    let new_row: Vec<u8> = (100..110u32).flat_map(|v| v.to_le_bytes()).collect();
    arr.append(&new_row, 0).unwrap();
    assert_eq!(arr.shape(), &[5, 10]);

    let mut out = vec![0u8; 10 * 4];
    arr.get_slice_buffer(&[4, 0], &[5, 10], &mut out, &[1, 10]).unwrap();
    assert_eq!(out, new_row);

    arr.delete(0, 4, 1).unwrap();
    assert_eq!(arr.shape(), &[4, 10]);
    let mut first = vec![0u8; 10 * 4];
    arr.get_slice_buffer(&[0, 0], &[1, 10], &mut first, &[1, 10]).unwrap();
    assert_eq!(first, row);
}

#[test]
fn copy_with_different_geometry_recompresses_and_preserves_contents() {
    let (c, d) = params();
    let src: Vec<u8> = (0..20 * 20 * 4).map(|i| (i % 200) as u8).collect();
    let arr = Array::from_buffer(&src, &[20, 20], &[10, 10], &[5, 5], 4, c, d).unwrap();
    let copied = arr.copy(&[4, 4], &[2, 2]).unwrap();
    assert_eq!(copied.to_buffer().unwrap(), src);
    assert_eq!(copied.chunkshape(), &[4, 4]);
}
