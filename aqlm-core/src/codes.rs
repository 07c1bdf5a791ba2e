//! Integer code storage and exact recovery of logical codebook indices.
//!
//! Codes are logically unsigned, but a codebook that uses the full range of
//! its storage width (`S = 256` in `i8`, `S = 65536` in `i16`) is persisted
//! in the signed type, so the upper half of the index range shows up as
//! negative numbers. A negative code in `i8`/`i16` storage is shifted back
//! by adding the codebook size `S`. The shift is an exact integer add on a
//! widened value, applied once: a code still negative after it is out of
//! range, never wrapped again. `i32` storage is taken at face value.

use crate::error::{AqlmError, Result};
use crate::tensor::{Storage, Tensor};

/// Undo signed storage of a logically unsigned index into a codebook of
/// `codebook_size` entries.
#[inline(always)]
pub fn resolve_signed(raw: i64, codebook_size: usize) -> i64 {
    if raw < 0 { raw + codebook_size as i64 } else { raw }
}

enum CodeSlice<'a> {
    U8(&'a [u8]),
    I8(&'a [i8]),
    U16(&'a [u16]),
    I16(&'a [i16]),
    I32(&'a [i32]),
}

/// Borrowed view over a code tensor of any supported integer width.
pub struct Codes<'a> {
    data: CodeSlice<'a>,
    codebook_size: usize,
}

impl<'a> Codes<'a> {
    pub fn new(tensor: &'a Tensor, codebook_size: usize) -> Result<Self> {
        let got = tensor.dtype();
        let capacity = got.code_capacity().ok_or_else(|| AqlmError::DTypeMismatch {
            tensor: "codes",
            expected: "an integer dtype".into(),
            got,
        })?;
        if codebook_size > capacity {
            return Err(AqlmError::DTypeMismatch {
                tensor: "codes",
                expected: format!("integer storage able to index {codebook_size} entries"),
                got,
            });
        }

        let data = match tensor.storage() {
            Storage::U8(v) => CodeSlice::U8(v),
            Storage::I8(v) => CodeSlice::I8(v),
            Storage::U16(v) => CodeSlice::U16(v),
            Storage::I16(v) => CodeSlice::I16(v),
            Storage::I32(v) => CodeSlice::I32(v),
            _ => {
                return Err(AqlmError::DTypeMismatch {
                    tensor: "codes",
                    expected: "an integer dtype".into(),
                    got,
                });
            }
        };

        Ok(Self {
            data,
            codebook_size,
        })
    }

    pub fn len(&self) -> usize {
        match &self.data {
            CodeSlice::U8(v) => v.len(),
            CodeSlice::I8(v) => v.len(),
            CodeSlice::U16(v) => v.len(),
            CodeSlice::I16(v) => v.len(),
            CodeSlice::I32(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stored value at `pos`, before reinterpretation.
    #[inline]
    pub fn raw(&self, pos: usize) -> i64 {
        match &self.data {
            CodeSlice::U8(v) => v[pos] as i64,
            CodeSlice::I8(v) => v[pos] as i64,
            CodeSlice::U16(v) => v[pos] as i64,
            CodeSlice::I16(v) => v[pos] as i64,
            CodeSlice::I32(v) => v[pos] as i64,
        }
    }

    /// Logical index at `pos`. Only signed narrow storage is shifted; a
    /// negative `i32` stays negative and fails validation.
    #[inline]
    pub fn get(&self, pos: usize) -> i64 {
        match &self.data {
            CodeSlice::U8(v) => v[pos] as i64,
            CodeSlice::I8(v) => resolve_signed(v[pos] as i64, self.codebook_size),
            CodeSlice::U16(v) => v[pos] as i64,
            CodeSlice::I16(v) => resolve_signed(v[pos] as i64, self.codebook_size),
            CodeSlice::I32(v) => v[pos] as i64,
        }
    }

    /// Resolve `out.len()` consecutive codes starting at `start`. Callers
    /// must have run [`Codes::validate`] first.
    #[inline]
    pub fn decode_into(&self, start: usize, out: &mut [u32]) {
        let end = start + out.len();
        let s = self.codebook_size;
        match &self.data {
            CodeSlice::U8(v) => {
                for (o, &r) in out.iter_mut().zip(&v[start..end]) {
                    *o = r as u32;
                }
            }
            CodeSlice::I8(v) => {
                for (o, &r) in out.iter_mut().zip(&v[start..end]) {
                    *o = resolve_signed(r as i64, s) as u32;
                }
            }
            CodeSlice::U16(v) => {
                for (o, &r) in out.iter_mut().zip(&v[start..end]) {
                    *o = r as u32;
                }
            }
            CodeSlice::I16(v) => {
                for (o, &r) in out.iter_mut().zip(&v[start..end]) {
                    *o = resolve_signed(r as i64, s) as u32;
                }
            }
            CodeSlice::I32(v) => {
                for (o, &r) in out.iter_mut().zip(&v[start..end]) {
                    *o = r as u32;
                }
            }
        }
    }

    /// Check every code resolves into `[0, codebook_size)`.
    pub fn validate(&self) -> Result<()> {
        let s = self.codebook_size as i64;
        for pos in 0..self.len() {
            let code = self.get(pos);
            if code < 0 || code >= s {
                return Err(AqlmError::CodeOutOfRange {
                    code: self.raw(pos),
                    position: pos,
                    codebook_size: self.codebook_size,
                });
            }
        }
        Ok(())
    }
}
