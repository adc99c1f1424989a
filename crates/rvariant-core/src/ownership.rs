//! 局面の所有表
//!
//! 1回のビルドの間だけ存在し、同一性キーごとに「その局面を展開するパス」を記録する。
//! 最初に見つけたパスが所有者になり、他のパスから同じ局面に到達しても展開しない。

use std::collections::HashMap;
use std::collections::hash_map::Entry;

use crate::identity::{PositionKey, canonicalize};
use crate::tree::{MoveTree, Path};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Claim {
    /// 新たに所有した、または既に同じパスが所有していた
    Owned,
    /// 別のパスが所有している
    OwnedBy(Path),
}

#[derive(Debug, Default, Clone)]
pub struct OwnershipMap {
    owners: HashMap<PositionKey, Path>,
}

impl OwnershipMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// 既存ツリーを前順に1回走査して所有者を登録する（先勝ち）。
    pub fn seeded_from(tree: &MoveTree) -> Self {
        let mut map = Self::new();
        for (path, id) in tree.walk() {
            map.owners.entry(canonicalize(tree.node(id).fen())).or_insert(path);
        }
        map
    }

    pub fn owner(&self, key: &PositionKey) -> Option<&Path> {
        self.owners.get(key)
    }

    pub fn is_owned_by_other(&self, key: &PositionKey, path: &Path) -> bool {
        self.owners.get(key).is_some_and(|owner| owner != path)
    }

    pub fn claim(&mut self, key: PositionKey, path: &Path) -> Claim {
        match self.owners.entry(key) {
            Entry::Occupied(e) if e.get() == path => Claim::Owned,
            Entry::Occupied(e) => Claim::OwnedBy(e.get().clone()),
            Entry::Vacant(e) => {
                e.insert(path.clone());
                Claim::Owned
            }
        }
    }

    pub fn len(&self) -> usize {
        self.owners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.owners.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::position::{STARTPOS_FEN, StandardChess};

    #[test]
    fn test_first_seen_path_owns_transposition() {
        let svc = StandardChess;
        let mut tree = MoveTree::from_line(&svc, STARTPOS_FEN, &["d4", "Nf6", "c4"]).unwrap();
        let c4 = tree.add_move_at(&svc, &Path::root(), "c4").unwrap();
        let nf6 = tree.add_move_at(&svc, &c4, "Nf6").unwrap();
        let d4 = tree.add_move_at(&svc, &nf6, "d4").unwrap();

        let map = OwnershipMap::seeded_from(&tree);
        let key = canonicalize(tree.node(tree.resolve(&d4).unwrap()).fen());
        assert_eq!(map.owner(&key).unwrap().to_string(), "0.0.0");
        assert!(map.is_owned_by_other(&key, &d4));
    }

    #[test]
    fn test_claim() {
        let mut map = OwnershipMap::new();
        let key = canonicalize(STARTPOS_FEN);
        let a = Path::from(vec![0]);
        let b = Path::from(vec![1]);
        assert_eq!(map.claim(key.clone(), &a), Claim::Owned);
        assert_eq!(map.claim(key.clone(), &a), Claim::Owned);
        assert_eq!(map.claim(key, &b), Claim::OwnedBy(a));
    }
}
