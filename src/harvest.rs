use std::collections::{HashMap, HashSet};

use tracing::{debug, warn};

use crate::models::{Breadcrumb, CourseOutline, TreeNode};

#[derive(Debug, thiserror::Error)]
pub enum HarvestError {
    #[error("block {block_id} in course {course_id} is reachable more than once")]
    Cycle { course_id: String, block_id: String },

    #[error("block {block_id} in course {course_id} is referenced but not defined")]
    MissingBlock { course_id: String, block_id: String },
}

/// Every harvested block of a program, keyed by block id.
#[derive(Debug, Clone, Default)]
pub struct Harvest {
    nodes: HashMap<String, TreeNode>,
}

impl Harvest {
    pub fn get(&self, block_id: &str) -> Option<&TreeNode> {
        self.nodes.get(block_id)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Nodes ordered by breadcrumb, then block id.
    pub fn sorted_nodes(&self) -> Vec<&TreeNode> {
        let mut nodes: Vec<&TreeNode> = self.nodes.values().collect();
        nodes.sort_by(|a, b| {
            a.breadcrumb
                .cmp(&b.breadcrumb)
                .then_with(|| a.block_id.cmp(&b.block_id))
        });
        nodes
    }

    fn insert(&mut self, node: TreeNode) {
        if let Some(previous) = self.nodes.insert(node.block_id.clone(), node) {
            warn!(
                block_id = %previous.block_id,
                name = %previous.display_name,
                "block id harvested twice, keeping the later course"
            );
        }
    }
}

/// Flattens one course tree into `harvest`.
///
/// Walks the outline depth-first from its root with an explicit stack, so
/// tree depth never touches the call stack. Each block may be reached once;
/// a second visit means the outline is not a tree.
pub fn harvest_course(outline: &CourseOutline, harvest: &mut Harvest) -> Result<(), HarvestError> {
    let mut visited: HashSet<&str> = HashSet::new();
    let mut stack: Vec<(&str, Breadcrumb)> = vec![(outline.root.as_str(), Breadcrumb::default())];

    while let Some((block_id, prefix)) = stack.pop() {
        if !visited.insert(block_id) {
            return Err(HarvestError::Cycle {
                course_id: outline.course_id.clone(),
                block_id: block_id.to_string(),
            });
        }

        let block = outline
            .blocks
            .get(block_id)
            .ok_or_else(|| HarvestError::MissingBlock {
                course_id: outline.course_id.clone(),
                block_id: block_id.to_string(),
            })?;

        let breadcrumb = prefix.child(&block.display_name);

        // reversed so children pop in declared order
        for child in block.children.iter().rev() {
            stack.push((child.as_str(), breadcrumb.clone()));
        }

        harvest.insert(TreeNode {
            block_id: block_id.to_string(),
            display_name: block.display_name.clone(),
            kind: breadcrumb.kind(),
            breadcrumb,
        });
    }

    debug!(course_id = %outline.course_id, blocks = visited.len(), "harvested course");
    Ok(())
}

pub fn harvest_program(outlines: &[CourseOutline]) -> Result<Harvest, HarvestError> {
    let mut harvest = Harvest::default();
    for outline in outlines {
        harvest_course(outline, &mut harvest)?;
    }
    Ok(harvest)
}

#[cfg(test)]
pub(crate) fn sample_outline() -> CourseOutline {
    let mut outline = CourseOutline::new("course-v1:CI+FS+2026", "m");
    outline.add_block(None, "m", "Python Fundamentals");
    outline.add_block(Some("m"), "s", "Getting Started");
    outline.add_block(Some("s"), "l1", "Variables");
    outline.add_block(Some("s"), "l2", "Loops");
    outline.add_block(Some("l1"), "u1", "Naming things");
    outline.add_block(Some("l2"), "u2", "For loops");
    outline.add_block(Some("u1"), "c1", "Video");
    outline.add_block(Some("c1"), "c1x", "Transcript");
    outline
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::NodeKind;

    #[test]
    fn records_breadcrumbs_for_every_block() {
        let harvest = harvest_program(&[sample_outline()]).unwrap();
        assert_eq!(harvest.len(), 8);

        let unit = harvest.get("u1").unwrap();
        assert_eq!(
            unit.breadcrumb.names(),
            ["Python Fundamentals", "Getting Started", "Variables", "Naming things"]
        );
        assert_eq!(unit.kind, NodeKind::Unit);
        assert_eq!(harvest.get("l2").unwrap().kind, NodeKind::Lesson);
        assert_eq!(harvest.get("c1x").unwrap().kind, NodeKind::Component);
    }

    #[test]
    fn depths_stay_within_known_levels() {
        let harvest = harvest_program(&[sample_outline()]).unwrap();
        for node in harvest.sorted_nodes() {
            let depth = node.breadcrumb.depth();
            assert!(depth >= 1);
            assert_eq!(node.kind, NodeKind::from_depth(depth));
        }
    }

    #[test]
    fn cycle_is_reported_instead_of_recursing() {
        let mut outline = sample_outline();
        outline.add_block(Some("u2"), "m", "Python Fundamentals");
        let err = harvest_program(&[outline]).unwrap_err();
        assert!(matches!(err, HarvestError::Cycle { ref block_id, .. } if block_id == "m"));
    }

    #[test]
    fn dangling_child_is_reported() {
        let mut outline = sample_outline();
        outline
            .blocks
            .get_mut("s")
            .unwrap()
            .children
            .push("ghost".to_string());
        let err = harvest_program(&[outline]).unwrap_err();
        assert!(matches!(err, HarvestError::MissingBlock { ref block_id, .. } if block_id == "ghost"));
    }

    #[test]
    fn deep_outline_is_walked_iteratively() {
        let mut outline = CourseOutline::new("deep", "b0");
        outline.add_block(None, "b0", "n0");
        for i in 1..1_000 {
            let parent = format!("b{}", i - 1);
            outline.add_block(Some(&parent), &format!("b{i}"), &format!("n{i}"));
        }
        let mut harvest = Harvest::default();
        harvest_course(&outline, &mut harvest).unwrap();
        assert_eq!(harvest.len(), 1_000);
    }

    #[test]
    fn programs_merge_courses() {
        let mut second = CourseOutline::new("course-v1:CI+FS+2027", "m2");
        second.add_block(None, "m2", "Careers");
        let harvest = harvest_program(&[sample_outline(), second]).unwrap();
        assert_eq!(harvest.len(), 9);
        assert_eq!(harvest.get("m2").unwrap().kind, NodeKind::Module);
    }
}
