use mimic_log::StaticLogConfig;

pub struct EngineLog;

impl StaticLogConfig for EngineLog {
    const MAX_BYTES_PER_LOG_FILE: u64 = 3_000_000;
    const MAX_LOG_FILES: usize = 10;
    const LOG_FILE_PREFIX: &'static str = "mimic-gateway";
}
