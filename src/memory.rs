//! Memory accounting for cos/sin tables.

use candle_core::DType;

/// Bytes held by a cos/sin cache of `seq_len` rows and `bands` columns.
///
/// Counts both tables.
#[must_use]
pub fn cos_sin_cache_bytes(seq_len: usize, bands: usize, dtype: DType) -> usize {
    2 * seq_len * bands * dtype.size_in_bytes()
}

/// Format bytes as a human-readable string.
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn format_bytes(bytes: usize) -> String {
    const KB: usize = 1024;
    const MB: usize = KB * 1024;
    const GB: usize = MB * 1024;

    if bytes >= GB {
        format!("{:.2} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{bytes} B")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cache_bytes_scale_with_dtype() {
        let f32_bytes = cos_sin_cache_bytes(4096, 64, DType::F32);
        let bf16_bytes = cos_sin_cache_bytes(4096, 64, DType::BF16);
        assert_eq!(f32_bytes, 2 * 4096 * 64 * 4);
        assert_eq!(bf16_bytes * 2, f32_bytes);
    }

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(2048), "2.00 KB");
        assert_eq!(format_bytes(3 * 1024 * 1024), "3.00 MB");
        assert_eq!(format_bytes(5 * 1024 * 1024 * 1024), "5.00 GB");
    }
}
