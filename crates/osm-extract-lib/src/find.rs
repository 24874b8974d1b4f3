//! Search helpers over a parsed file.

use std::io::{Read, Seek};
use std::sync::Mutex;

use crate::element::{ElementKind, OwnedRelation, Relation};
use crate::parser::{CancelToken, Parser};
use crate::Result;

impl<R: Read + Seek> Parser<R> {
    /// Returns every relation that has at least one relation member.
    pub fn find_super_relations(&mut self, cancel: &CancelToken) -> Result<Vec<OwnedRelation>> {
        let found = Mutex::new(Vec::new());
        let relation_cb = |relation: &Relation<'_>| {
            if relation
                .members
                .iter()
                .any(|m| m.kind == ElementKind::Relation)
            {
                found.lock().unwrap().push(relation.to_owned());
            }
        };
        self.parse(cancel, None, None, Some(&relation_cb))?;
        Ok(found.into_inner().unwrap())
    }
}
