//! 列式行批次

use crate::common::{LakeError, Result};
use crate::field_type::Value;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Chunk {
    columns: Vec<Vec<Value>>,
}

impl Chunk {
    pub fn new(num_columns: usize) -> Self {
        Self { columns: vec![Vec::new(); num_columns] }
    }

    /// 所有列必须等长
    pub fn from_columns(columns: Vec<Vec<Value>>) -> Result<Self> {
        if let Some(first) = columns.first() {
            if let Some(bad) = columns.iter().position(|c| c.len() != first.len()) {
                return Err(LakeError::InvalidArgument(format!(
                    "column {bad} has {} rows, column 0 has {}", columns[bad].len(), first.len()
                )));
            }
        }
        Ok(Self { columns })
    }

    pub fn num_columns(&self) -> usize { self.columns.len() }

    pub fn num_rows(&self) -> usize {
        self.columns.first().map_or(0, |c| c.len())
    }

    pub fn is_empty(&self) -> bool { self.num_rows() == 0 }

    pub fn column(&self, idx: usize) -> &[Value] { &self.columns[idx] }

    pub fn row(&self, idx: usize) -> Vec<Value> {
        self.columns.iter().map(|c| c[idx].clone()).collect()
    }

    pub fn append_row(&mut self, row: Vec<Value>) -> Result<()> {
        if row.len() != self.columns.len() {
            return Err(LakeError::InvalidArgument(format!(
                "row has {} values, chunk has {} columns", row.len(), self.columns.len()
            )));
        }
        for (col, v) in self.columns.iter_mut().zip(row) {
            col.push(v);
        }
        Ok(())
    }

    /// 按下标追加 `src` 中的行
    pub fn append_selective(&mut self, src: &Chunk, indexes: &[u32]) -> Result<()> {
        if src.num_columns() != self.num_columns() {
            return Err(LakeError::InvalidArgument(format!(
                "source chunk has {} columns, expected {}", src.num_columns(), self.num_columns()
            )));
        }
        if let Some(&bad) = indexes.iter().find(|&&i| i as usize >= src.num_rows()) {
            return Err(LakeError::InvalidArgument(format!(
                "row index {bad} out of range, source has {} rows", src.num_rows()
            )));
        }
        for (dst, col) in self.columns.iter_mut().zip(&src.columns) {
            dst.extend(indexes.iter().map(|&i| col[i as usize].clone()));
        }
        Ok(())
    }

    pub fn into_rows(self) -> Vec<Vec<Value>> {
        let n = self.num_rows();
        let mut rows: Vec<Vec<Value>> = (0..n).map(|_| Vec::with_capacity(self.columns.len())).collect();
        for col in self.columns {
            for (row, v) in rows.iter_mut().zip(col) {
                row.push(v);
            }
        }
        rows
    }

    pub fn clear(&mut self) {
        self.columns.iter_mut().for_each(Vec::clear);
    }
}
