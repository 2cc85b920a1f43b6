//! Layout transforms for fused projection weights
//!
//! The internal `c_attn` projection stores, for every key/value group `g`,
//! the query rows of that group followed by its key rows and value rows:
//!
//! ```text
//! [ q(g=0) | k(g=0) | v(g=0) | q(g=1) | k(g=1) | v(g=1) | ... ]
//! ```
//!
//! With one group (multi-query) this degenerates to `cat(q, k, v)`. All
//! transforms work on dimension 0, so they apply equally to weights
//! (`[rows, in]`) and biases (`[rows]`).

use candle_core::Tensor;
use dolomite::{AttentionGeometry, Error, Result};

use crate::tensor::bitwise_equal;

fn check_rows(tensor: &Tensor, rows: usize, name: &str) -> Result<()> {
    let dims = tensor.dims();
    if dims.first().copied() != Some(rows) {
        let mut expected = dims.to_vec();
        match expected.first_mut() {
            Some(first) => *first = rows,
            None => expected.push(rows),
        }
        return Err(Error::shape_mismatch(name, &expected, dims));
    }
    Ok(())
}

fn check_trailing(reference: &Tensor, other: &Tensor, name: &str) -> Result<()> {
    if reference.dims()[1..] != other.dims()[1..] {
        let mut expected = reference.dims().to_vec();
        expected[0] = other.dims()[0];
        return Err(Error::shape_mismatch(name, &expected, other.dims()));
    }
    Ok(())
}

/// Fuse separate query, key and value projections into the grouped layout
pub fn interleave_query_key_value(
    query: &Tensor,
    key: &Tensor,
    value: &Tensor,
    geometry: &AttentionGeometry,
    name: &str,
) -> Result<Tensor> {
    check_rows(query, geometry.query_rows(), name)?;
    check_rows(key, geometry.key_value_rows(), name)?;
    check_rows(value, geometry.key_value_rows(), name)?;
    check_trailing(query, key, name)?;
    check_trailing(query, value, name)?;

    let head_dim = geometry.head_dim;
    let group_query_rows = geometry.query_heads_per_group() * head_dim;

    let mut chunks = Vec::with_capacity(3 * geometry.num_key_value_heads);
    for group in 0..geometry.num_key_value_heads {
        chunks.push(query.narrow(0, group * group_query_rows, group_query_rows)?);
        chunks.push(key.narrow(0, group * head_dim, head_dim)?);
        chunks.push(value.narrow(0, group * head_dim, head_dim)?);
    }
    Ok(Tensor::cat(&chunks, 0)?.contiguous()?)
}

/// Split a grouped fused projection back into query, key and value
pub fn split_query_key_value(
    fused: &Tensor,
    geometry: &AttentionGeometry,
    name: &str,
) -> Result<(Tensor, Tensor, Tensor)> {
    check_rows(fused, geometry.fused_rows(), name)?;

    let head_dim = geometry.head_dim;
    let group_query_rows = geometry.query_heads_per_group() * head_dim;
    let group_rows = group_query_rows + 2 * head_dim;

    let groups = geometry.num_key_value_heads;
    let mut queries = Vec::with_capacity(groups);
    let mut keys = Vec::with_capacity(groups);
    let mut values = Vec::with_capacity(groups);
    for group in 0..groups {
        let base = group * group_rows;
        queries.push(fused.narrow(0, base, group_query_rows)?);
        keys.push(fused.narrow(0, base + group_query_rows, head_dim)?);
        values.push(fused.narrow(0, base + group_query_rows + head_dim, head_dim)?);
    }

    Ok((
        Tensor::cat(&queries, 0)?.contiguous()?,
        Tensor::cat(&keys, 0)?.contiguous()?,
        Tensor::cat(&values, 0)?.contiguous()?,
    ))
}

/// Expand grouped key or value heads to one head per query head.
///
/// Each group head is repeated contiguously, so query head `h` ends up
/// paired with the copy of group `h / query_heads_per_group`.
pub fn repeat_key_value_heads(
    tensor: &Tensor,
    geometry: &AttentionGeometry,
    name: &str,
) -> Result<Tensor> {
    check_rows(tensor, geometry.key_value_rows(), name)?;

    let head_dim = geometry.head_dim;
    let repeats = geometry.query_heads_per_group();
    let mut heads = Vec::with_capacity(geometry.num_heads);
    for group in 0..geometry.num_key_value_heads {
        let head = tensor.narrow(0, group * head_dim, head_dim)?;
        for _ in 0..repeats {
            heads.push(head.clone());
        }
    }
    Ok(Tensor::cat(&heads, 0)?.contiguous()?)
}

/// Collapse repeated key or value heads back to one head per group.
///
/// Every head of a group must be a bitwise copy of the group's first head;
/// otherwise the collapse would lose information and
/// [`Error::HeadGroupMismatch`] is returned.
pub fn deduplicate_key_value_heads(
    tensor: &Tensor,
    geometry: &AttentionGeometry,
    name: &str,
) -> Result<Tensor> {
    check_rows(tensor, geometry.query_rows(), name)?;

    let head_dim = geometry.head_dim;
    let repeats = geometry.query_heads_per_group();
    let mut heads = Vec::with_capacity(geometry.num_key_value_heads);
    for group in 0..geometry.num_key_value_heads {
        let first = tensor.narrow(0, group * repeats * head_dim, head_dim)?;
        for copy in 1..repeats {
            let other = tensor.narrow(0, (group * repeats + copy) * head_dim, head_dim)?;
            if !bitwise_equal(&first, &other)? {
                return Err(Error::HeadGroupMismatch {
                    name: name.to_string(),
                    group,
                });
            }
        }
        heads.push(first);
    }
    Ok(Tensor::cat(&heads, 0)?.contiguous()?)
}

/// Fuse the up and gate projections of a gated MLP as `cat(up, gate)`
pub fn interleave_up_gate(up: &Tensor, gate: &Tensor, inner_size: usize, name: &str) -> Result<Tensor> {
    check_rows(up, inner_size, name)?;
    check_rows(gate, inner_size, name)?;
    check_trailing(up, gate, name)?;
    Ok(Tensor::cat(&[up, gate], 0)?.contiguous()?)
}

/// Split a fused gated MLP projection into `(up, gate)`
pub fn split_up_gate(fused: &Tensor, inner_size: usize, name: &str) -> Result<(Tensor, Tensor)> {
    check_rows(fused, 2 * inner_size, name)?;
    Ok((
        fused.narrow(0, 0, inner_size)?.contiguous()?,
        fused.narrow(0, inner_size, inner_size)?.contiguous()?,
    ))
}
