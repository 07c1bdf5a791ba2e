use serde::{Deserialize, Serialize};
use std::fmt;

/// Storage types for activations, codebooks, codes and scales.
///
/// Codes are logically unsigned indices but are commonly persisted in the
/// signed integer of the same width (`I8` for 8-bit codebooks, `I16` for
/// 16-bit ones). See [`crate::codes`] for the reinterpretation rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DType {
    // --- Floating point ---
    F32,
    F16,
    BF16,

    // --- Integer (codes) ---
    U8,
    I8,
    U16,
    I16,
    I32,
}

impl DType {
    /// Size in bytes of one element.
    pub fn size_of(&self) -> usize {
        match self {
            DType::F32 | DType::I32 => 4,
            DType::F16 | DType::BF16 | DType::U16 | DType::I16 => 2,
            DType::U8 | DType::I8 => 1,
        }
    }

    pub fn is_float(&self) -> bool {
        matches!(self, DType::F32 | DType::F16 | DType::BF16)
    }

    /// Number of distinct code values this storage can carry, counting the
    /// negative half of signed narrow types as reinterpreted indices.
    pub fn code_capacity(&self) -> Option<usize> {
        match self {
            DType::U8 | DType::I8 => Some(1 << 8),
            DType::U16 | DType::I16 => Some(1 << 16),
            DType::I32 => Some(i32::MAX as usize + 1),
            _ => None,
        }
    }

    /// Narrowest signed storage for codes into a codebook of `codebook_size`
    /// entries.
    pub fn for_codebook_size(codebook_size: usize) -> DType {
        if codebook_size <= 1 << 8 {
            DType::I8
        } else if codebook_size <= 1 << 16 {
            DType::I16
        } else {
            DType::I32
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            DType::F32 => "f32",
            DType::F16 => "f16",
            DType::BF16 => "bf16",
            DType::U8 => "u8",
            DType::I8 => "i8",
            DType::U16 => "u16",
            DType::I16 => "i16",
            DType::I32 => "i32",
        }
    }

    pub fn from_name(name: &str) -> Option<DType> {
        match name.to_ascii_lowercase().as_str() {
            "f32" | "float32" => Some(DType::F32),
            "f16" | "float16" | "half" => Some(DType::F16),
            "bf16" | "bfloat16" => Some(DType::BF16),
            "u8" | "uint8" => Some(DType::U8),
            "i8" | "int8" => Some(DType::I8),
            "u16" | "uint16" => Some(DType::U16),
            "i16" | "int16" => Some(DType::I16),
            "i32" | "int32" => Some(DType::I32),
            _ => None,
        }
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_code_storage_for_size() {
        assert_eq!(DType::for_codebook_size(16), DType::I8);
        assert_eq!(DType::for_codebook_size(256), DType::I8);
        assert_eq!(DType::for_codebook_size(257), DType::I16);
        assert_eq!(DType::for_codebook_size(65536), DType::I16);
        assert_eq!(DType::for_codebook_size(65537), DType::I32);
    }

    #[test]
    fn test_capacity() {
        assert_eq!(DType::I8.code_capacity(), Some(256));
        assert_eq!(DType::U16.code_capacity(), Some(65536));
        assert_eq!(DType::F16.code_capacity(), None);
        assert!(DType::BF16.is_float());
        assert!(!DType::I16.is_float());
    }

    #[test]
    fn test_name_roundtrip() {
        for d in [DType::F32, DType::F16, DType::BF16, DType::I8, DType::U16] {
            assert_eq!(DType::from_name(d.name()), Some(d));
        }
        assert_eq!(DType::from_name("float16"), Some(DType::F16));
        assert_eq!(DType::from_name("q4_0"), None);
    }

    #[test]
    fn test_serde_lowercase() {
        let s = serde_json::to_string(&DType::BF16).unwrap();
        assert_eq!(s, "\"bf16\"");
        let d: DType = serde_json::from_str("\"i16\"").unwrap();
        assert_eq!(d, DType::I16);
    }
}
