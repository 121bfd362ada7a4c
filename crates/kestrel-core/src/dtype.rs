use std::fmt;

/// Element types understood by the runtime.
///
/// Discriminants match the data-type codes of the model file's tensor table.
/// Quantized types carry no scale/zero-point here; kernels own that.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum DType {
    /// 32-bit IEEE 754 single-precision float
    F32 = 0,
    /// 16-bit IEEE 754 half-precision float
    F16 = 1,
    /// 16-bit Brain Float
    BF16 = 2,
    /// 8-bit signed integer
    I8 = 3,
    /// 8-bit unsigned integer
    U8 = 4,
    /// 16-bit quantized integer
    QInt16 = 10,
    /// 8-bit quantized integer
    QInt8 = 11,
    /// 4-bit quantized integer, two per byte
    QInt4 = 12,
}

impl DType {
    /// Decode a tensor-table data-type code.
    pub fn from_code(code: u32) -> Option<Self> {
        match code {
            0 => Some(DType::F32),
            1 => Some(DType::F16),
            2 => Some(DType::BF16),
            3 => Some(DType::I8),
            4 => Some(DType::U8),
            10 => Some(DType::QInt16),
            11 => Some(DType::QInt8),
            12 => Some(DType::QInt4),
            _ => None,
        }
    }

    /// Data-type code as stored in the tensor table.
    pub fn code(&self) -> u32 {
        *self as u32
    }

    /// Size in bytes of a single element, or None for sub-byte types.
    pub fn element_size(&self) -> Option<usize> {
        match self {
            DType::F32 => Some(4),
            DType::F16 | DType::BF16 | DType::QInt16 => Some(2),
            DType::I8 | DType::U8 | DType::QInt8 => Some(1),
            DType::QInt4 => None,
        }
    }

    /// Number of bytes needed to store `n` elements of this dtype.
    pub fn storage_bytes(&self, n: usize) -> usize {
        match self.element_size() {
            Some(width) => width * n,
            // two nibbles per byte
            None => n.div_ceil(2),
        }
    }

    /// Whether this dtype is a floating-point type.
    pub fn is_float(&self) -> bool {
        matches!(self, DType::F32 | DType::F16 | DType::BF16)
    }

    /// Whether this dtype is a quantized type.
    pub fn is_quantized(&self) -> bool {
        matches!(self, DType::QInt16 | DType::QInt8 | DType::QInt4)
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DType::F32 => "f32",
            DType::F16 => "f16",
            DType::BF16 => "bf16",
            DType::I8 => "i8",
            DType::U8 => "u8",
            DType::QInt16 => "qint16",
            DType::QInt8 => "qint8",
            DType::QInt4 => "qint4",
        };
        write!(f, "{s}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_code_roundtrip() {
        for code in [0u32, 1, 2, 3, 4, 10, 11, 12] {
            let dtype = DType::from_code(code).unwrap();
            assert_eq!(dtype.code(), code);
        }
        assert_eq!(DType::from_code(5), None);
        assert_eq!(DType::from_code(13), None);
    }

    #[test]
    fn test_storage_bytes() {
        assert_eq!(DType::F32.storage_bytes(10), 40);
        assert_eq!(DType::F16.storage_bytes(10), 20);
        assert_eq!(DType::BF16.storage_bytes(3), 6);
        assert_eq!(DType::QInt16.storage_bytes(3), 6);
        assert_eq!(DType::QInt8.storage_bytes(7), 7);
        assert_eq!(DType::U8.storage_bytes(7), 7);
    }

    #[test]
    fn test_qint4_rounds_up() {
        assert_eq!(DType::QInt4.element_size(), None);
        assert_eq!(DType::QInt4.storage_bytes(1), 1);
        assert_eq!(DType::QInt4.storage_bytes(4), 2);
        assert_eq!(DType::QInt4.storage_bytes(5), 3);
        assert_eq!(DType::QInt4.storage_bytes(0), 0);
    }

    #[test]
    fn test_classification() {
        assert!(DType::BF16.is_float());
        assert!(!DType::QInt8.is_float());
        assert!(DType::QInt4.is_quantized());
        assert!(!DType::I8.is_quantized());
    }
}
