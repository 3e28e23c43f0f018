use std::path::Path;

use anyhow::Context;
use serde::Serialize;

use crate::harvest::Harvest;
use crate::models::NodeKind;
use crate::syllabus::WeightTable;

/// One harvested block as stored in the breadcrumbs table.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BreadcrumbRow {
    pub block_id: String,
    pub kind: String,
    pub module: String,
    pub section: String,
    pub lesson: String,
    pub unit: String,
    /// Remaining levels below the unit, joined with " > ".
    pub component: String,
    /// Course position of the block's lesson in the syllabus.
    pub order_index: Option<i32>,
}

pub fn build_rows(harvest: &Harvest, weights: &WeightTable) -> Vec<BreadcrumbRow> {
    harvest
        .sorted_nodes()
        .into_iter()
        .map(|node| {
            let crumb = &node.breadcrumb;
            let order_index = match node.kind {
                NodeKind::Module | NodeKind::Section => None,
                _ => weights
                    .order_index(&node.block_id, crumb)
                    .and_then(|index| i32::try_from(index).ok()),
            };
            BreadcrumbRow {
                block_id: node.block_id.clone(),
                kind: node.kind.to_string(),
                module: crumb.level(0).to_string(),
                section: crumb.level(1).to_string(),
                lesson: crumb.level(2).to_string(),
                unit: crumb.level(3).to_string(),
                component: crumb.names().iter().skip(4).cloned().collect::<Vec<_>>().join(" > "),
                order_index,
            }
        })
        .collect()
}

pub fn write_csv(path: &Path, rows: &[BreadcrumbRow]) -> anyhow::Result<()> {
    let mut writer = csv::Writer::from_path(path)
        .with_context(|| format!("failed to create {}", path.display()))?;
    for row in rows {
        writer.serialize(row)?;
    }
    writer.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::harvest::{harvest_program, sample_outline};
    use crate::syllabus::SAMPLE_SYLLABUS;

    fn rows() -> Vec<BreadcrumbRow> {
        let harvest = harvest_program(&[sample_outline()]).unwrap();
        let weights = WeightTable::from_json(SAMPLE_SYLLABUS).unwrap();
        build_rows(&harvest, &weights)
    }

    #[test]
    fn rows_split_breadcrumb_levels() {
        let rows = rows();
        assert_eq!(rows.len(), 8);

        let transcript = rows.iter().find(|row| row.block_id == "c1x").unwrap();
        assert_eq!(transcript.kind, "component");
        assert_eq!(transcript.lesson, "Variables");
        assert_eq!(transcript.unit, "Naming things");
        assert_eq!(transcript.component, "Video > Transcript");

        let module = rows.iter().find(|row| row.block_id == "m").unwrap();
        assert_eq!(module.section, "");
        assert_eq!(module.order_index, None);
    }

    #[test]
    fn lesson_order_comes_from_syllabus() {
        let rows = rows();
        let order = |id: &str| rows.iter().find(|row| row.block_id == id).unwrap().order_index;
        assert_eq!(order("l1"), Some(0));
        assert_eq!(order("l2"), Some(1));
        // units inherit their lesson's position through the name lookup
        assert_eq!(order("u2"), Some(1));
    }

    #[test]
    fn writes_csv_with_header() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("breadcrumbs.csv");
        write_csv(&path, &rows()).unwrap();

        let written = std::fs::read_to_string(&path).unwrap();
        let mut lines = written.lines();
        assert_eq!(
            lines.next(),
            Some("block_id,kind,module,section,lesson,unit,component,order_index")
        );
        assert_eq!(lines.count(), 8);
    }
}
