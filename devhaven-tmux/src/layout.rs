//! Parser for tmux window layout strings.
//!
//! `%layout-change` carries the full layout of a window, e.g.
//! `f865,89x24,0,0{44x24,0,0,1,44x24,45,0,2}`:
//! - `f865,` = checksum (skipped)
//! - `89x24,0,0` = dimensions and position
//! - `{...}` = children side by side, `[...]` = children stacked
//! - a trailing number = pane ID of a leaf

use crate::types::TmuxPaneId;

/// Size and offset of a layout cell, in character cells.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CellGeometry {
    pub width: usize,
    pub height: usize,
    pub x: usize,
    pub y: usize,
}

/// How the children of a split cell are arranged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SplitKind {
    /// `{...}`: children laid out left to right
    SideBySide,
    /// `[...]`: children laid out top to bottom
    Stacked,
}

/// A node in the tmux layout tree
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LayoutNode {
    Pane {
        id: TmuxPaneId,
        geometry: CellGeometry,
    },
    Split {
        kind: SplitKind,
        geometry: CellGeometry,
        children: Vec<LayoutNode>,
    },
}

impl LayoutNode {
    pub fn geometry(&self) -> CellGeometry {
        match self {
            LayoutNode::Pane { geometry, .. } | LayoutNode::Split { geometry, .. } => *geometry,
        }
    }
}

/// Parsed tmux layout
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TmuxLayout {
    pub root: LayoutNode,
}

impl TmuxLayout {
    /// Parse a tmux layout string, with or without the checksum prefix.
    pub fn parse(layout: &str) -> Option<Self> {
        let layout = strip_checksum(layout.trim());
        if layout.is_empty() {
            return None;
        }

        let (root, rest) = parse_node(layout)?;
        if !rest.is_empty() {
            return None;
        }
        Some(Self { root })
    }

    /// Every leaf pane with its geometry, in layout order.
    pub fn panes(&self) -> Vec<(TmuxPaneId, CellGeometry)> {
        let mut out = Vec::new();
        collect_panes(&self.root, &mut out);
        out
    }

    pub fn pane_ids(&self) -> Vec<TmuxPaneId> {
        self.panes().into_iter().map(|(id, _)| id).collect()
    }
}

/// Drop a leading `xxxx,` checksum (four hex digits).
fn strip_checksum(s: &str) -> &str {
    match s.split_once(',') {
        Some((prefix, rest))
            if prefix.len() == 4 && prefix.chars().all(|c| c.is_ascii_hexdigit()) =>
        {
            rest
        }
        _ => s,
    }
}

fn parse_node(s: &str) -> Option<(LayoutNode, &str)> {
    let (width, s) = parse_number(s)?;
    let s = s.strip_prefix('x')?;
    let (height, s) = parse_number(s)?;
    let s = s.strip_prefix(',')?;
    let (x, s) = parse_number(s)?;
    let s = s.strip_prefix(',')?;
    let (y, s) = parse_number(s)?;
    let geometry = CellGeometry {
        width,
        height,
        x,
        y,
    };

    if let Some(rest) = s.strip_prefix('{') {
        let (children, rest) = parse_children(rest, '}')?;
        Some((
            LayoutNode::Split {
                kind: SplitKind::SideBySide,
                geometry,
                children,
            },
            rest,
        ))
    } else if let Some(rest) = s.strip_prefix('[') {
        let (children, rest) = parse_children(rest, ']')?;
        Some((
            LayoutNode::Split {
                kind: SplitKind::Stacked,
                geometry,
                children,
            },
            rest,
        ))
    } else {
        let rest = s.strip_prefix(',')?;
        let (id, rest) = parse_number(rest)?;
        Some((
            LayoutNode::Pane {
                id: id as TmuxPaneId,
                geometry,
            },
            rest,
        ))
    }
}

fn parse_children(s: &str, close: char) -> Option<(Vec<LayoutNode>, &str)> {
    let mut children = Vec::new();
    let mut remaining = s;

    loop {
        let (child, rest) = parse_node(remaining)?;
        children.push(child);

        if let Some(rest) = rest.strip_prefix(close) {
            return Some((children, rest));
        }
        remaining = rest.strip_prefix(',')?;
    }
}

fn parse_number(s: &str) -> Option<(usize, &str)> {
    let end = s.find(|c: char| !c.is_ascii_digit()).unwrap_or(s.len());
    if end == 0 {
        return None;
    }
    let num = s[..end].parse().ok()?;
    Some((num, &s[end..]))
}

fn collect_panes(node: &LayoutNode, out: &mut Vec<(TmuxPaneId, CellGeometry)>) {
    match node {
        LayoutNode::Pane { id, geometry } => out.push((*id, *geometry)),
        LayoutNode::Split { children, .. } => {
            for child in children {
                collect_panes(child, out);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_single_pane() {
        let layout = TmuxLayout::parse("89x24,0,0,1").unwrap();
        assert_eq!(
            layout.root,
            LayoutNode::Pane {
                id: 1,
                geometry: CellGeometry {
                    width: 89,
                    height: 24,
                    x: 0,
                    y: 0
                }
            }
        );
    }

    #[test]
    fn test_parse_side_by_side() {
        let layout = TmuxLayout::parse("89x24,0,0{44x24,0,0,1,44x24,45,0,2}").unwrap();
        match &layout.root {
            LayoutNode::Split { kind, children, .. } => {
                assert_eq!(*kind, SplitKind::SideBySide);
                assert_eq!(children.len(), 2);
                assert_eq!(children[1].geometry().x, 45);
            }
            other => panic!("Expected split, got {other:?}"),
        }
    }

    #[test]
    fn test_parse_stacked_with_checksum() {
        let layout = TmuxLayout::parse("b25d,89x24,0,0[89x12,0,0,1,89x11,0,13,2]").unwrap();
        match &layout.root {
            LayoutNode::Split { kind, .. } => assert_eq!(*kind, SplitKind::Stacked),
            other => panic!("Expected split, got {other:?}"),
        }
        let panes = layout.panes();
        assert_eq!(panes[1].0, 2);
        assert_eq!(panes[1].1.y, 13);
        assert_eq!(panes[1].1.height, 11);
    }

    #[test]
    fn test_nested_splits() {
        let layout =
            TmuxLayout::parse("89x24,0,0{44x24,0,0[44x12,0,0,1,44x11,0,13,2],44x24,45,0,3}")
                .unwrap();
        assert_eq!(layout.pane_ids(), vec![1, 2, 3]);
    }

    #[test]
    fn test_rejects_garbage() {
        assert!(TmuxLayout::parse("").is_none());
        assert!(TmuxLayout::parse("not-a-layout").is_none());
        assert!(TmuxLayout::parse("89x24,0,0{44x24,0,0,1").is_none());
        assert!(TmuxLayout::parse("89x24,0,0,1trailing").is_none());
    }
}
