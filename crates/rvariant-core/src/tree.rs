//! 変化ツリー
//!
//! 各ノードは1手（ルートのみ初期局面）を表し、子の並びは意味を持つ。
//! index 0 が本譜（mainline）、1 以降が変化（variation）。
//!
//! ノードはアリーナ（`Vec<MoveNode>`）に格納し `NodeId` で参照する。
//! 外部からの位置指定は `Path`（ルートからの子インデックス列）で行う。
//! このモジュールはノードを削除しない。

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::position::{PositionError, PositionService};
use crate::types::UciMove;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(usize);

impl NodeId {
    pub const ROOT: NodeId = NodeId(0);

    #[inline]
    pub const fn index(self) -> usize {
        self.0
    }
}

/// ルートからの子インデックス列。
///
/// 位置ベースなので、上流で構造が変わると同じノードを指さなくなる。
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Path(Vec<usize>);

impl Path {
    pub fn root() -> Self {
        Self(Vec::new())
    }

    pub fn is_root(&self) -> bool {
        self.0.is_empty()
    }

    pub fn depth(&self) -> usize {
        self.0.len()
    }

    pub fn as_slice(&self) -> &[usize] {
        &self.0
    }

    pub fn child(&self, index: usize) -> Path {
        let mut v = self.0.clone();
        v.push(index);
        Path(v)
    }

    pub fn parent(&self) -> Option<Path> {
        if self.0.is_empty() {
            return None;
        }
        Some(Path(self.0[..self.0.len() - 1].to_vec()))
    }

    pub fn starts_with(&self, prefix: &Path) -> bool {
        self.0.starts_with(&prefix.0)
    }
}

impl From<Vec<usize>> for Path {
    fn from(v: Vec<usize>) -> Self {
        Self(v)
    }
}

impl std::fmt::Display for Path {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_root() {
            return f.write_str("(root)");
        }
        for (i, idx) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(".")?;
            }
            write!(f, "{idx}")?;
        }
        Ok(())
    }
}

impl std::str::FromStr for Path {
    type Err = TreeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() || s == "(root)" {
            return Ok(Path::root());
        }
        s.split('.')
            .map(|part| {
                part.parse::<usize>().map_err(|_| TreeError::InvalidPathSyntax {
                    input: s.to_string(),
                })
            })
            .collect::<Result<Vec<_>, _>>()
            .map(Path)
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TreeError {
    #[error("path {path} does not resolve to a node")]
    UnknownPath { path: String },

    #[error("invalid path syntax '{input}' (expected e.g. 0.1.0)")]
    InvalidPathSyntax { input: String },

    #[error("corrupt tree: {reason}")]
    Corrupt { reason: String },

    #[error(transparent)]
    Position(#[from] PositionError),
}

/// 1手分のノード
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MoveNode {
    san: Option<String>,
    uci: Option<UciMove>,
    fen: String,
    children: Vec<NodeId>,
    parent: Option<NodeId>,
    /// コメント（ビルダーは触らない）
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
    /// 注釈記号など（ビルダーは触らない）
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub annotations: Vec<String>,
}

impl MoveNode {
    pub fn san(&self) -> Option<&str> {
        self.san.as_deref()
    }

    pub fn uci(&self) -> Option<&UciMove> {
        self.uci.as_ref()
    }

    pub fn fen(&self) -> &str {
        &self.fen
    }

    pub fn children(&self) -> &[NodeId] {
        &self.children
    }

    pub fn parent(&self) -> Option<NodeId> {
        self.parent
    }
}

/// `MoveTree::add_move` の結果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddedMove {
    pub id: NodeId,
    /// 親の children 内での位置
    pub index: usize,
    /// 新規作成なら true、既存の子を再利用したなら false
    pub created: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MoveTree {
    nodes: Vec<MoveNode>,
}

impl MoveTree {
    pub fn new(root_fen: impl Into<String>) -> Self {
        Self {
            nodes: vec![MoveNode {
                san: None,
                uci: None,
                fen: root_fen.into(),
                children: Vec::new(),
                parent: None,
                comment: None,
                annotations: Vec::new(),
            }],
        }
    }

    /// 初期局面から1本の手順（UCI または SAN）を本譜として持つツリーを作る。
    pub fn from_line<P: PositionService + ?Sized>(
        positions: &P,
        root_fen: &str,
        moves: &[&str],
    ) -> Result<Self, TreeError> {
        positions.validate(root_fen)?;
        let mut tree = Self::new(root_fen);
        let mut cur = NodeId::ROOT;
        for text in moves {
            let fen = tree.node(cur).fen.clone();
            let mv = positions.parse_move(&fen, text)?;
            cur = tree.add_move(positions, cur, &mv)?.id;
        }
        Ok(tree)
    }

    #[inline]
    pub fn root(&self) -> NodeId {
        NodeId::ROOT
    }

    /// ノード数（ルートを含む）
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.len() <= 1
    }

    /// `NodeId` はこのツリーが発行したものに限る。
    pub fn node(&self, id: NodeId) -> &MoveNode {
        &self.nodes[id.0]
    }

    pub fn get(&self, id: NodeId) -> Option<&MoveNode> {
        self.nodes.get(id.0)
    }

    pub fn resolve(&self, path: &Path) -> Option<NodeId> {
        let mut cur = NodeId::ROOT;
        for &idx in path.as_slice() {
            cur = *self.nodes[cur.0].children.get(idx)?;
        }
        Some(cur)
    }

    pub fn resolve_or_err(&self, path: &Path) -> Result<NodeId, TreeError> {
        self.resolve(path).ok_or_else(|| TreeError::UnknownPath {
            path: path.to_string(),
        })
    }

    pub fn child_by_san(&self, parent: NodeId, san: &str) -> Option<NodeId> {
        self.nodes[parent.0]
            .children
            .iter()
            .copied()
            .find(|&c| self.nodes[c.0].san.as_deref() == Some(san))
    }

    /// 指し手を子として追加する。
    ///
    /// 同じ SAN の子が既にあればそれを返す（新規ノードは作らない）。
    /// 子のない親に最初に追加した手は index 0、つまり本譜になる。
    pub fn add_move<P: PositionService + ?Sized>(
        &mut self,
        positions: &P,
        parent: NodeId,
        mv: &UciMove,
    ) -> Result<AddedMove, PositionError> {
        let parent_fen = self.nodes[parent.0].fen.clone();
        let san = positions.to_san(&parent_fen, mv)?;
        if let Some(existing) = self.child_by_san(parent, &san) {
            let index = self.nodes[parent.0]
                .children
                .iter()
                .position(|&c| c == existing)
                .unwrap_or_default();
            return Ok(AddedMove {
                id: existing,
                index,
                created: false,
            });
        }
        let fen = positions.apply(&parent_fen, mv)?;
        let id = NodeId(self.nodes.len());
        self.nodes.push(MoveNode {
            san: Some(san),
            uci: Some(mv.clone()),
            fen,
            children: Vec::new(),
            parent: Some(parent),
            comment: None,
            annotations: Vec::new(),
        });
        let children = &mut self.nodes[parent.0].children;
        children.push(id);
        Ok(AddedMove {
            id,
            index: children.len() - 1,
            created: true,
        })
    }

    /// パスで指定したノードに UCI / SAN の指し手を追加し、子のパスを返す。
    pub fn add_move_at<P: PositionService + ?Sized>(
        &mut self,
        positions: &P,
        path: &Path,
        text: &str,
    ) -> Result<Path, TreeError> {
        let parent = self.resolve_or_err(path)?;
        let mv = positions.parse_move(&self.nodes[parent.0].fen, text)?;
        let added = self.add_move(positions, parent, &mv)?;
        Ok(path.child(added.index))
    }

    /// 深さ優先（前順、子は index 順）でノードを列挙する。
    pub fn walk(&self) -> Walk<'_> {
        self.walk_from(NodeId::ROOT, Path::root())
    }

    /// `start` 以下の部分木を列挙する。`start_path` は `start` のパス。
    pub fn walk_from(&self, start: NodeId, start_path: Path) -> Walk<'_> {
        Walk {
            tree: self,
            stack: vec![(start, start_path)],
        }
    }

    /// 逆シリアライズしたツリーの整合性を確認する。
    pub fn check_consistency(&self) -> Result<(), TreeError> {
        let corrupt = |reason: String| Err(TreeError::Corrupt { reason });
        let Some(root) = self.nodes.first() else {
            return corrupt("no root node".to_string());
        };
        if root.parent.is_some() || root.san.is_some() {
            return corrupt("root must have no parent and no move".to_string());
        }
        for (i, node) in self.nodes.iter().enumerate() {
            for &c in &node.children {
                match self.nodes.get(c.0) {
                    Some(child) if child.parent == Some(NodeId(i)) => {}
                    _ => return corrupt(format!("node {i} has a dangling child {}", c.0)),
                }
            }
            if i > 0 && node.san.is_none() {
                return corrupt(format!("node {i} has no move"));
            }
            if let Some(p) = node.parent {
                if !self.nodes.get(p.0).is_some_and(|pn| pn.children.contains(&NodeId(i))) {
                    return corrupt(format!("node {i} is not listed by its parent {}", p.0));
                }
            } else if i > 0 {
                return corrupt(format!("node {i} has no parent"));
            }
        }
        Ok(())
    }
}

/// 明示スタックによる前順走査
pub struct Walk<'a> {
    tree: &'a MoveTree,
    stack: Vec<(NodeId, Path)>,
}

impl Iterator for Walk<'_> {
    type Item = (Path, NodeId);

    fn next(&mut self) -> Option<Self::Item> {
        let (id, path) = self.stack.pop()?;
        let children = &self.tree.nodes[id.0].children;
        // index 0 を先に取り出すため逆順に積む
        for (idx, &child) in children.iter().enumerate().rev() {
            self.stack.push((child, path.child(idx)));
        }
        Some((path, id))
    }
}
