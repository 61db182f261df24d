/// Default configuration constants for the LettuceDetect API server

// Model defaults
pub const DEFAULT_MODEL: &str = "KRLabsOrg/lettucedect-base-modernbert-en-v1";
pub const DEFAULT_METHOD: &str = "transformer";
pub const DEFAULT_SPAN_THRESHOLD: f64 = 0.5;
pub const DEFAULT_MAX_LENGTH: usize = 4096;

// Network defaults
pub const DEFAULT_HOST: &str = "127.0.0.1";
pub const DEFAULT_PORT: u16 = 8000;
pub const DEFAULT_MAX_BODY_BYTES: usize = 2 * 1024 * 1024; // 2MB

// Model file names
pub const MODEL_FILENAME: &str = "model.onnx";
pub const TOKENIZER_FILENAME: &str = "tokenizer.json";
pub const ONNX_SUBDIR: &str = "onnx";

// Model hub
pub const HF_RESOLVE_BASE_URL: &str = "https://huggingface.co";
pub const MODEL_DOWNLOAD_TIMEOUT_SECS: u64 = 300;

// Endpoints
pub const TOKEN_ENDPOINT: &str = "/v1/lettucedetect/token";
pub const SPANS_ENDPOINT: &str = "/v1/lettucedetect/spans";
pub const HEALTH_ENDPOINT: &str = "/health";

// Environment overrides
pub const ENV_MODEL: &str = "LETTUCEDETECT_MODEL";
pub const ENV_METHOD: &str = "LETTUCEDETECT_METHOD";
pub const ENV_HOST: &str = "LETTUCEDETECT_HOST";
pub const ENV_PORT: &str = "LETTUCEDETECT_PORT";
