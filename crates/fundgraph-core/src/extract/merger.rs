//! Stitching per-page table blocks into logical holdings tables.
//!
//! Blocks are scanned in page order. A block joins the open merge group when
//! enough of its columns align with the group's header by normalized name;
//! otherwise the group is closed and the block starts a new one. Rows of a
//! joining block are rearranged into the group's column order, so every row in
//! a [`MergedTable`] shares one schema. Under-merging is preferred to gluing
//! unrelated columns together.

use tracing::{debug, warn};

use crate::config::PipelineConfig;
use crate::extract::similarity::edit_similarity;
use crate::models::{IngestionIssue, MergedTable, RawRow, RawTableBlock};

/// Lowercase, drop whitespace, keep alphanumerics and `%`.
pub fn normalize_header_cell(cell: &str) -> String {
    cell.chars()
        .filter(|c| c.is_alphanumeric() || *c == '%')
        .flat_map(|c| c.to_lowercase())
        .collect()
}

pub fn header_signature(header: &[String]) -> Vec<String> {
    header.iter().map(|c| normalize_header_cell(c)).collect()
}

/// Column mapping from a group header onto a candidate block header.
#[derive(Clone, Debug, PartialEq)]
pub struct HeaderAlignment {
    /// For each group column, the block column that feeds it.
    pub mapping: Vec<Option<usize>>,
    pub aligned: usize,
    /// `aligned / max(named columns on either side)`.
    pub overlap: f64,
}

/// Align `candidate` onto `group`. Exact normalized matches are taken first,
/// then remaining columns pair up by edit similarity. Unnamed columns never
/// count towards the overlap.
pub fn align_headers(group: &[String], candidate: &[String], column_similarity: f64) -> HeaderAlignment {
    let mut mapping: Vec<Option<usize>> = vec![None; group.len()];
    let mut used = vec![false; candidate.len()];

    for (i, name) in group.iter().enumerate() {
        if name.is_empty() {
            continue;
        }
        if let Some(j) = (0..candidate.len()).find(|&j| !used[j] && &candidate[j] == name) {
            mapping[i] = Some(j);
            used[j] = true;
        }
    }

    for (i, name) in group.iter().enumerate() {
        if name.is_empty() || mapping[i].is_some() {
            continue;
        }
        let best = (0..candidate.len())
            .filter(|&j| !used[j] && !candidate[j].is_empty())
            .map(|j| (j, edit_similarity(name, &candidate[j])))
            .filter(|(_, score)| *score >= column_similarity)
            .max_by(|a, b| a.1.total_cmp(&b.1).then(b.0.cmp(&a.0)));
        if let Some((j, _)) = best {
            mapping[i] = Some(j);
            used[j] = true;
        }
    }

    let aligned = mapping.iter().filter(|m| m.is_some()).count();
    let named_group = group.iter().filter(|n| !n.is_empty()).count();
    let named_candidate = candidate.iter().filter(|n| !n.is_empty()).count();
    let denominator = named_group.max(named_candidate).max(1);
    HeaderAlignment {
        mapping,
        aligned,
        overlap: aligned as f64 / denominator as f64,
    }
}

#[derive(Clone, Debug, Default)]
pub struct MergeOutcome {
    pub tables: Vec<MergedTable>,
    pub gaps: Vec<IngestionIssue>,
}

struct MergeGroup {
    signature: Vec<String>,
    table: MergedTable,
}

impl MergeGroup {
    fn open(block: &RawTableBlock, signature: Vec<String>) -> Self {
        let width = block.header_row.len();
        let rows = block
            .rows
            .iter()
            .map(|cells| RawRow {
                page_index: block.page_index,
                cells: fit_width(cells, width),
            })
            .collect();
        Self {
            signature,
            table: MergedTable {
                fund_name: None,
                amc_hint: None,
                header: block.header_row.iter().map(|c| c.trim().to_string()).collect(),
                pages: vec![block.page_index],
                rows,
            },
        }
    }

    fn absorb(&mut self, block: &RawTableBlock, alignment: &HeaderAlignment) {
        for cells in &block.rows {
            let remapped = alignment
                .mapping
                .iter()
                .map(|source| {
                    source
                        .and_then(|j| cells.get(j))
                        .map(|c| c.to_string())
                        .unwrap_or_default()
                })
                .collect();
            self.table.rows.push(RawRow {
                page_index: block.page_index,
                cells: remapped,
            });
        }
        if self.table.pages.last() != Some(&block.page_index) {
            self.table.pages.push(block.page_index);
        }
    }
}

fn fit_width(cells: &[String], width: usize) -> Vec<String> {
    let mut out: Vec<String> = cells.iter().take(width).cloned().collect();
    out.resize(width, String::new());
    out
}

pub struct TableMerger {
    min_header_overlap: f64,
    column_similarity: f64,
}

impl TableMerger {
    pub fn new(config: &PipelineConfig) -> Self {
        Self {
            min_header_overlap: config.min_header_overlap,
            column_similarity: config.header_column_similarity,
        }
    }

    pub fn merge(&self, blocks: &[RawTableBlock]) -> MergeOutcome {
        let mut ordered: Vec<&RawTableBlock> = blocks.iter().collect();
        // Stable: blocks on the same page keep their extraction order.
        ordered.sort_by_key(|b| b.page_index);

        let mut outcome = MergeOutcome::default();
        let mut current: Option<MergeGroup> = None;

        for block in ordered {
            let signature = header_signature(&block.header_row);
            if signature.iter().all(|c| c.is_empty()) {
                warn!(
                    page_index = block.page_index,
                    rows = block.rows.len(),
                    "skipping table block with empty or unparseable header"
                );
                outcome.gaps.push(IngestionIssue::ExtractionGap {
                    page_index: Some(block.page_index),
                    reason: format!(
                        "table with {} row(s) has no usable header",
                        block.rows.len()
                    ),
                });
                continue;
            }

            if let Some(group) = current.as_mut() {
                let alignment = align_headers(&group.signature, &signature, self.column_similarity);
                if alignment.overlap >= self.min_header_overlap {
                    debug!(
                        page_index = block.page_index,
                        overlap = alignment.overlap,
                        "continuing merged table"
                    );
                    group.absorb(block, &alignment);
                    continue;
                }
                debug!(
                    page_index = block.page_index,
                    overlap = alignment.overlap,
                    "header mismatch, starting new table"
                );
            }

            if let Some(done) = current.take() {
                outcome.tables.push(done.table);
            }
            current = Some(MergeGroup::open(block, signature));
        }

        if let Some(done) = current.take() {
            outcome.tables.push(done.table);
        }
        outcome
    }
}
