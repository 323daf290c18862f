//! Block-structured attention masks.
//!
//! The mask is never built densely from token pairs. It is a relation over
//! contiguous ownership blocks: token `i` may attend to token `j` iff `j <= i`
//! and either `j`'s owner path is an ancestor-or-self of `i`'s owner path, or
//! `j`'s block is marked shared and appears earlier in the sequence. Everything
//! else is masked out, which is what keeps one module's cached state free of
//! any unrelated sibling's content.

use std::ops::Range;

use candle_core::{DType, Device, Result as CandleResult, Tensor};

use crate::instance::PromptInstance;
use crate::schema::NodePath;

#[derive(Debug, Clone)]
struct MaskBlock {
    owner: NodePath,
    module_idx: usize,
    range: Range<usize>,
    allow_shared: bool,
}

/// The full-instance mask, represented as ordered ownership blocks.
#[derive(Debug, Clone)]
pub struct BlockMask {
    seq_len: usize,
    blocks: Vec<MaskBlock>,
}

pub struct AttentionMaskBuilder;

impl AttentionMaskBuilder {
    /// Derive the block mask for an instance. O(number of segments), never
    /// O(N^2).
    pub fn build(instance: &PromptInstance) -> BlockMask {
        let mut blocks = Vec::new();
        for (module_idx, module) in instance.modules().iter().enumerate() {
            for segment in &module.segments {
                blocks.push(MaskBlock {
                    owner: segment.owner.clone(),
                    module_idx,
                    range: segment.range.clone(),
                    allow_shared: segment.allow_shared,
                });
            }
        }
        BlockMask {
            seq_len: instance.len(),
            blocks,
        }
    }
}

impl BlockMask {
    pub fn seq_len(&self) -> usize {
        self.seq_len
    }

    fn block_of(&self, token: usize) -> &MaskBlock {
        let idx = self
            .blocks
            .partition_point(|b| b.range.end <= token)
            .min(self.blocks.len() - 1);
        &self.blocks[idx]
    }

    fn block_visible(query: &MaskBlock, key: &MaskBlock) -> bool {
        if std::ptr::eq(query, key) {
            return true;
        }
        key.owner.is_ancestor_or_self(&query.owner) || key.allow_shared
    }

    /// Whether token `i` may attend to token `j`.
    pub fn allows(&self, i: usize, j: usize) -> bool {
        if i >= self.seq_len || j > i {
            return false;
        }
        Self::block_visible(self.block_of(i), self.block_of(j))
    }

    /// The visible key-column ranges for one query row, causally clipped.
    /// Out-of-range rows have no visible columns.
    pub fn visible_ranges(&self, i: usize) -> Vec<Range<usize>> {
        if i >= self.seq_len {
            return Vec::new();
        }
        let query = self.block_of(i);
        let mut out = Vec::new();
        for key in &self.blocks {
            if key.range.start > i {
                break;
            }
            if Self::block_visible(query, key) {
                push_merged(&mut out, key.range.start..key.range.end.min(i + 1));
            }
        }
        out
    }

    /// The isolation-frame mask for one selected module: rows are the module's
    /// tokens in local coordinates, columns are restricted to the module's own
    /// span. This is the slice handed to the collaborator for a miss, and by
    /// construction it is identical no matter which other modules surround the
    /// module in the request — the property that makes the cached result
    /// reusable.
    pub fn slice_for_module(&self, instance: &PromptInstance, module_idx: usize) -> MaskSlice {
        let span = instance.modules()[module_idx].span.clone();
        let local: Vec<&MaskBlock> = self
            .blocks
            .iter()
            .filter(|b| b.module_idx == module_idx)
            .collect();
        let mut rows = Vec::with_capacity(span.len());
        for i in span.clone() {
            let query = self.block_of(i);
            let mut visible = Vec::new();
            for &key in &local {
                if key.range.start > i {
                    break;
                }
                if Self::block_visible(query, key) {
                    let clipped = key.range.start..key.range.end.min(i + 1);
                    push_merged(
                        &mut visible,
                        clipped.start - span.start..clipped.end - span.start,
                    );
                }
            }
            rows.push(visible);
        }
        MaskSlice {
            len: span.len(),
            rows,
        }
    }

    /// Materialize the full additive-bias mask (0 attend, -inf masked).
    /// Densifies to N x N; intended for collaborators that want one tensor,
    /// not for the core's own bookkeeping.
    pub fn to_bias_tensor(&self, dtype: DType, device: &Device) -> CandleResult<Tensor> {
        let n = self.seq_len;
        let mut bias = vec![f32::NEG_INFINITY; n * n];
        for i in 0..n {
            for range in self.visible_ranges(i) {
                for j in range {
                    bias[i * n + j] = 0.0;
                }
            }
        }
        Tensor::from_vec(bias, (n, n), device)?.to_dtype(dtype)
    }
}

/// A module-local mask slice: per-row visible column ranges, both in local
/// zero-based coordinates.
#[derive(Debug, Clone)]
pub struct MaskSlice {
    len: usize,
    rows: Vec<Vec<Range<usize>>>,
}

impl MaskSlice {
    /// A plain causal slice over `len` tokens, with no internal structure.
    pub fn causal(len: usize) -> Self {
        Self {
            len,
            rows: (0..len).map(|i| vec![0..i + 1]).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn rows(&self) -> &[Vec<Range<usize>>] {
        &self.rows
    }

    pub fn allows(&self, i: usize, j: usize) -> bool {
        i < self.len && self.rows[i].iter().any(|r| r.contains(&j))
    }

    pub fn to_bias_tensor(&self, dtype: DType, device: &Device) -> CandleResult<Tensor> {
        let n = self.len;
        let mut bias = vec![f32::NEG_INFINITY; n * n];
        for (i, row) in self.rows.iter().enumerate() {
            for range in row {
                for j in range.clone() {
                    bias[i * n + j] = 0.0;
                }
            }
        }
        Tensor::from_vec(bias, (n, n), device)?.to_dtype(dtype)
    }
}

fn push_merged(ranges: &mut Vec<Range<usize>>, next: Range<usize>) {
    if next.is_empty() {
        return;
    }
    if let Some(last) = ranges.last_mut() {
        if last.end >= next.start {
            last.end = last.end.max(next.end);
            return;
        }
    }
    ranges.push(next);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instance::{Bindings, PromptInstance};
    use crate::schema::SchemaTree;

    fn build(selection: &[&str], shared_doc: bool) -> (PromptInstance, BlockMask) {
        let def = format!(
            r#"{{
                "name": "chat",
                "children": [
                    {{"module": {{"name": "system", "children": [{{"text": {{"tokens": [10, 11]}}}}]}}}},
                    {{"module": {{"name": "doc", "shared": {shared_doc}, "children": [{{"text": {{"tokens": [20, 21, 22]}}}}]}}}},
                    {{"module": {{"name": "query", "children": [{{"param": {{"name": "q"}}}}]}}}}
                ]
            }}"#
        );
        let schema = SchemaTree::parse(&def).unwrap();
        let bindings = Bindings::new().bind("q", vec![40, 41]);
        let selection: Vec<_> = selection.iter().map(|s| s.parse().unwrap()).collect();
        let instance = PromptInstance::instantiate(&schema, &selection, &bindings).unwrap();
        let mask = AttentionMaskBuilder::build(&instance);
        (instance, mask)
    }

    #[test]
    fn siblings_cannot_see_each_other() {
        // [system: 0..2, doc: 2..5, query: 5..7]
        let (_, mask) = build(&["chat/system", "chat/doc", "chat/query"], false);
        for i in 0..7 {
            for j in 0..7 {
                let same_module = (i < 2 && j < 2) || (2..5).contains(&i) && (2..5).contains(&j)
                    || i >= 5 && j >= 5;
                assert_eq!(
                    mask.allows(i, j),
                    j <= i && same_module,
                    "unexpected visibility {i} -> {j}"
                );
            }
        }
    }

    #[test]
    fn causality_always_holds() {
        let (_, mask) = build(&["chat/system", "chat/doc"], true);
        for i in 0..5 {
            for j in i + 1..5 {
                assert!(!mask.allows(i, j));
            }
        }
    }

    #[test]
    fn shared_block_is_visible_to_later_modules_only() {
        // doc shared, order [doc: 0..3, system: 3..5, query: 5..7].
        let (_, mask) = build(&["chat/doc", "chat/system", "chat/query"], true);
        // Later modules see the shared doc block.
        assert!(mask.allows(3, 0));
        assert!(mask.allows(6, 2));
        // The shared doc never sees anyone else (nothing precedes it here, and
        // causality blocks the rest).
        assert!(!mask.allows(0, 3));
        assert!(!mask.allows(2, 5));
        // system and query still cannot see each other.
        assert!(!mask.allows(5, 3));
    }

    #[test]
    fn module_slice_is_self_contained_and_placement_independent() {
        let (a, mask_a) = build(&["chat/system", "chat/doc", "chat/query"], false);
        let (b, mask_b) = build(&["chat/doc", "chat/query"], false);
        let slice_a = mask_a.slice_for_module(&a, 1); // doc in position 1
        let slice_b = mask_b.slice_for_module(&b, 0); // doc in position 0
        assert_eq!(slice_a.len(), 3);
        assert_eq!(slice_a.rows(), slice_b.rows());
        for i in 0..3 {
            for j in 0..3 {
                assert_eq!(slice_a.allows(i, j), j <= i);
            }
        }
    }

    #[test]
    fn empty_instance_mask_has_no_visible_rows() {
        let schema = SchemaTree::parse(
            r#"{"name": "chat", "children": [{"module": {"name": "footer"}}]}"#,
        )
        .unwrap();
        let selection = vec!["chat/footer".parse().unwrap()];
        let instance =
            PromptInstance::instantiate(&schema, &selection, &Bindings::new()).unwrap();
        let mask = AttentionMaskBuilder::build(&instance);
        assert_eq!(mask.seq_len(), 0);
        assert!(mask.visible_ranges(0).is_empty());
        assert!(!mask.allows(0, 0));
    }

    #[test]
    fn bias_tensor_matches_block_relation() {
        let (_, mask) = build(&["chat/system", "chat/query"], false);
        let bias = mask
            .to_bias_tensor(DType::F32, &Device::Cpu)
            .unwrap()
            .to_vec2::<f32>()
            .unwrap();
        for i in 0..mask.seq_len() {
            for j in 0..mask.seq_len() {
                let expected = if mask.allows(i, j) { 0.0 } else { f32::NEG_INFINITY };
                assert_eq!(bias[i][j], expected);
            }
        }
    }
}
