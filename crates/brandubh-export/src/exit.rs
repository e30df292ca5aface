// Exit codes for precise CI triage
pub const EXIT_SUCCESS: i32 = 0;
pub const EXIT_CONVERSION_FAIL: i32 = 1;
pub const EXIT_INVALID_CONFIG: i32 = 2;
/// The FP32 artifact was written; only the quantized copy is missing.
pub const EXIT_QUANTIZATION_FAIL: i32 = 3;
