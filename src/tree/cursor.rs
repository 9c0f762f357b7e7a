use log::debug;

use super::{remove, search, store, traverse, Session, Tree};
use crate::{
    database::Database,
    error::DbError,
    key::{Direction, Key, KeyFilter},
    transaction::{PendingRead, Transaction},
    types::{Completion, DbResult, Pod},
    utils::HandyRwLock,
    value::Value,
};

/// A session's handle onto one tree: an owned key and value buffer,
/// the session state (claims, level cache), and an optional
/// transaction whose update buffer cursor operations divert into.
pub struct Cursor {
    tree: Pod<Tree>,
    session: Session,
    key: Key,
    value: Value,
    transaction: Option<Transaction>,
}

impl Cursor {
    pub fn new(tree: Pod<Tree>) -> Cursor {
        Cursor {
            tree,
            session: Database::new_session(),
            key: Key::new(),
            value: Value::new(),
            transaction: None,
        }
    }

    pub fn tree(&self) -> &Pod<Tree> {
        &self.tree
    }

    pub fn key(&self) -> &Key {
        &self.key
    }

    pub fn key_mut(&mut self) -> &mut Key {
        &mut self.key
    }

    pub fn set_key(&mut self, key: &Key) -> &mut Cursor {
        self.key = key.clone();
        self
    }

    pub fn value(&self) -> &Value {
        &self.value
    }

    pub fn value_mut(&mut self) -> &mut Value {
        &mut self.value
    }

    // ------------------------------------------------------------------
    // transactions

    pub fn begin(&mut self) -> Completion {
        if self.transaction.is_some() {
            return Err(DbError::validation("transaction already active"));
        }
        self.transaction = Some(Transaction::new());
        Ok(())
    }

    pub fn in_transaction(&self) -> bool {
        self.transaction.is_some()
    }

    pub fn commit(&mut self) -> Completion {
        match self.transaction.take() {
            Some(tx) => tx.commit(),
            None => Err(DbError::validation("no active transaction")),
        }
    }

    pub fn abort(&mut self) -> Completion {
        match self.transaction.take() {
            Some(tx) => tx.abort(),
            None => Err(DbError::validation("no active transaction")),
        }
    }

    // ------------------------------------------------------------------
    // operations

    /// Store the cursor's value under its key.
    pub fn store(&mut self) -> Completion {
        let handle = self.tree.rl().handle();
        if let Some(tx) = self.transaction.as_mut() {
            if self.key.is_empty() || self.key.is_right_edge() {
                return Err(DbError::validation("store requires a real key"));
            }
            tx.record_store(handle, &self.key, self.value.as_slice());
            return Ok(());
        }
        store::store(&self.tree, &mut self.session, &self.key, self.value.as_slice())
    }

    pub fn store_bytes(&mut self, bytes: &[u8]) -> Completion {
        self.value.put(bytes);
        self.store()
    }

    /// Load the value stored under the cursor's key. Returns false
    /// when the key is absent.
    pub fn fetch(&mut self) -> DbResult<bool> {
        self.fetch_min_bytes(0)
    }

    /// Like `fetch`, but permits a partial read of a long record: at
    /// least `min_bytes` of it are loaded.
    pub fn fetch_min_bytes(&mut self, min_bytes: usize) -> DbResult<bool> {
        let handle = self.tree.rl().handle();
        if let Some(tx) = self.transaction.as_ref() {
            match tx.read(handle, &self.key) {
                Some(PendingRead::Stored(bytes)) => {
                    self.value.put(&bytes);
                    return Ok(true);
                }
                Some(PendingRead::Removed) => return Ok(false),
                None => {}
            }
        }
        match search::fetch(&self.tree, &mut self.session, &self.key, min_bytes)? {
            Some(bytes) => {
                self.value.put(&bytes);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Remove the cursor's key. Returns whether a record existed.
    pub fn remove(&mut self) -> DbResult<bool> {
        let handle = self.tree.rl().handle();
        if let Some(tx) = self.transaction.as_mut() {
            if self.key.is_empty() || self.key.is_right_edge() {
                return Err(DbError::validation("remove requires a real key"));
            }
            tx.record_remove(handle, &self.key);
            return Ok(true);
        }
        remove::remove(&self.tree, &mut self.session, &self.key)
    }

    /// Remove every key in the half-open range `[low, high)`.
    pub fn remove_key_range(&mut self, low: &Key, high: &Key) -> DbResult<bool> {
        let handle = self.tree.rl().handle();
        if let Some(tx) = self.transaction.as_mut() {
            if low >= high {
                return Err(DbError::validation("remove range is empty or inverted"));
            }
            tx.record_remove_range(handle, low, high);
            return Ok(true);
        }
        remove::remove_key_range(&self.tree, &mut self.session, low, high)
    }

    /// Step to the next key in the requested direction, updating the
    /// cursor's key and value. Returns false at the edge of the
    /// keyspace (no wrap-around).
    pub fn traverse(&mut self, direction: Direction, deep: bool) -> DbResult<bool> {
        self.traverse_filtered(direction, deep, None)
    }

    pub fn traverse_filtered(
        &mut self,
        direction: Direction,
        deep: bool,
        filter: Option<&dyn KeyFilter>,
    ) -> DbResult<bool> {
        if self.transaction.is_none() {
            let mut key = self.key.clone();
            match traverse::traverse(
                &self.tree,
                &mut self.session,
                &mut key,
                direction,
                deep,
                filter,
                0,
            )? {
                Some(value) => {
                    self.key = key;
                    self.value.put(&value);
                    return Ok(true);
                }
                None => return Ok(false),
            }
        }

        self.traverse_with_buffer(direction, deep, filter)
    }

    /// Merge the transaction's update buffer into the traversal: the
    /// nearer of the tree's next key and the buffer's next pending
    /// store wins, and keys the buffer marks removed are skipped.
    fn traverse_with_buffer(
        &mut self,
        direction: Direction,
        deep: bool,
        filter: Option<&dyn KeyFilter>,
    ) -> DbResult<bool> {
        if direction == Direction::Eq {
            return self.fetch();
        }
        let handle = self.tree.rl().handle();
        let forward = direction.is_forward();
        let target_depth = if self.key.is_left_edge() || self.key.is_right_edge() {
            1
        } else {
            self.key.depth()
        };

        let mut search = self.key.clone();
        let mut allow_equal = direction.allows_equal();

        loop {
            let dir = effective_direction(forward, allow_equal);

            let mut tree_key = search.clone();
            let tree_hit = traverse::traverse(
                &self.tree,
                &mut self.session,
                &mut tree_key,
                dir,
                deep,
                filter,
                0,
            )?;

            let from = if search.is_right_edge() {
                vec![0xFFu8; crate::key::MAX_KEY_LENGTH + 1]
            } else {
                search.encoded().to_vec()
            };
            let buffer_hit = self
                .transaction
                .as_ref()
                .and_then(|tx| tx.next_pending(handle, &from, forward, allow_equal));

            // decide which candidate is nearer in the walk direction
            let use_buffer = match (&buffer_hit, tree_hit.is_some()) {
                (None, false) => return Ok(false),
                (None, true) => false,
                (Some(_), false) => true,
                (Some((bk, _)), true) => {
                    if forward {
                        bk.as_slice() <= tree_key.encoded()
                    } else {
                        bk.as_slice() >= tree_key.encoded()
                    }
                }
            };

            if use_buffer {
                let (bk, read) = buffer_hit.unwrap();
                let candidate = Key::from_encoded(&bk);
                let acceptable = (deep || candidate.depth() == target_depth)
                    && filter.map(|f| f.contains(&candidate)).unwrap_or(true);
                match read {
                    PendingRead::Stored(bytes) if acceptable => {
                        self.key = candidate;
                        self.value.put(&bytes);
                        return Ok(true);
                    }
                    _ => {
                        // removed (or filtered out): step past it
                        search = candidate;
                        allow_equal = false;
                        continue;
                    }
                }
            }

            // the tree candidate won; the buffer may still veto it
            let candidate = tree_key;
            let veto = self
                .transaction
                .as_ref()
                .and_then(|tx| tx.read(handle, &candidate))
                .map(|r| matches!(r, PendingRead::Removed))
                .unwrap_or(false);
            if veto {
                debug!("traverse skips {:?}: removed in the update buffer", candidate);
                search = candidate;
                allow_equal = false;
                continue;
            }

            self.key = candidate;
            if let Some(value) = tree_hit {
                self.value.put(&value);
            }
            return Ok(true);
        }
    }
}

fn effective_direction(forward: bool, allow_equal: bool) -> Direction {
    match (forward, allow_equal) {
        (true, true) => Direction::Gteq,
        (true, false) => Direction::Gt,
        (false, true) => Direction::Lteq,
        (false, false) => Direction::Lt,
    }
}

impl Drop for Cursor {
    fn drop(&mut self) {
        if let Some(tx) = self.transaction.take() {
            let _ = tx.abort();
        }
        Database::release_session(&mut self.session);
    }
}
