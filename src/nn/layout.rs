//! Flat parameter layout
//!
//! Every rank keeps its parameters (and gradients) in one contiguous `f32`
//! buffer. `ParamLayout` maps each named tensor to its range in that
//! buffer, in a fixed canonical order shared by all ranks.

use std::ops::Range;

use crate::error::{Error, Result};

/// One named tensor inside a flat buffer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParamEntry {
    name: String,
    shape: Vec<usize>,
    offset: usize,
    numel: usize,
}

impl ParamEntry {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn numel(&self) -> usize {
        self.numel
    }

    pub fn range(&self) -> Range<usize> {
        self.offset..self.offset + self.numel
    }
}

/// Canonical ordering and offsets of all parameters
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ParamLayout {
    entries: Vec<ParamEntry>,
    total: usize,
}

impl ParamLayout {
    /// Build a layout from `(name, shape)` pairs, packed in the given order.
    pub fn new<I, S>(specs: I) -> Result<Self>
    where
        I: IntoIterator<Item = (S, Vec<usize>)>,
        S: Into<String>,
    {
        let mut entries: Vec<ParamEntry> = Vec::new();
        let mut offset = 0usize;
        for (name, shape) in specs {
            let name = name.into();
            if entries.iter().any(|e| e.name == name) {
                return Err(Error::ModelError {
                    reason: format!("duplicate parameter name '{name}'"),
                });
            }
            let numel = shape.iter().product::<usize>();
            if shape.is_empty() || numel == 0 {
                return Err(Error::ModelError {
                    reason: format!("parameter '{name}' has empty shape {shape:?}"),
                });
            }
            entries.push(ParamEntry {
                name,
                shape,
                offset,
                numel,
            });
            offset += numel;
        }
        Ok(Self {
            entries,
            total: offset,
        })
    }

    /// Number of parameter tensors.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Total number of scalar elements across all parameters.
    pub fn total_numel(&self) -> usize {
        self.total
    }

    pub fn entries(&self) -> &[ParamEntry] {
        &self.entries
    }

    pub fn entry(&self, index: usize) -> Result<&ParamEntry> {
        self.entries.get(index).ok_or_else(|| Error::InvalidArgument {
            arg: "index",
            reason: format!("parameter {index} out of range ({} params)", self.len()),
        })
    }

    pub fn range(&self, index: usize) -> Result<Range<usize>> {
        self.entry(index).map(ParamEntry::range)
    }

    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.entries.iter().position(|e| e.name == name)
    }

    /// Borrow parameter `index` out of a flat buffer.
    pub fn slice<'a>(&self, buffer: &'a [f32], index: usize) -> Result<&'a [f32]> {
        let range = self.range(index)?;
        self.check_len(buffer.len())?;
        Ok(&buffer[range])
    }

    /// Mutably borrow parameter `index` out of a flat buffer.
    pub fn slice_mut<'a>(&self, buffer: &'a mut [f32], index: usize) -> Result<&'a mut [f32]> {
        let range = self.range(index)?;
        self.check_len(buffer.len())?;
        Ok(&mut buffer[range])
    }

    /// Error unless a buffer of `len` elements matches this layout.
    pub fn check_len(&self, len: usize) -> Result<()> {
        if len != self.total {
            return Err(Error::InvalidArgument {
                arg: "buffer",
                reason: format!("expected {} elements, got {len}", self.total),
            });
        }
        Ok(())
    }
}
