use std::collections::HashMap;

use crate::schemas::{Expense, Group};

pub trait Keyed {
    fn key(&self) -> &str;
}

impl Keyed for Group {
    fn key(&self) -> &str {
        &self.id
    }
}

impl Keyed for Expense {
    fn key(&self) -> &str {
        &self.id
    }
}

/// Rows in arrival order, reconciled by id. A row seen through both the
/// initial fetch and a live notification is kept once.
#[derive(Debug)]
pub struct RecordStore<T> {
    rows: Vec<T>,
    index: HashMap<String, usize>,
}

impl<T> Default for RecordStore<T> {
    fn default() -> Self {
        RecordStore {
            rows: Vec::new(),
            index: HashMap::new(),
        }
    }
}

impl<T: Keyed> RecordStore<T> {
    pub fn replace_all(&mut self, rows: Vec<T>) {
        self.clear();
        for row in rows {
            self.upsert(row);
        }
    }

    /// Inserts or overwrites the row with the same id. Returns true when the
    /// id was not present yet.
    pub fn upsert(&mut self, row: T) -> bool {
        match self.index.get(row.key()) {
            Some(&position) => {
                self.rows[position] = row;
                false
            }
            None => {
                self.index.insert(row.key().to_string(), self.rows.len());
                self.rows.push(row);
                true
            }
        }
    }

    pub fn clear(&mut self) {
        self.rows.clear();
        self.index.clear();
    }

    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.rows.iter()
    }
}
