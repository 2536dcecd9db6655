/// Pipeline names, as used on the command line, in config keys, and in reports.
/// Reference tables come first so dependent sheets can resolve their keys.
pub const POND: &str = "pond";
pub const BATCH: &str = "batch";
pub const POND_BATCH_ASSIGNMENT: &str = "pond_batch_assignment";
pub const DAILY_RECORD: &str = "daily_record";
pub const WEEKLY_CHECK: &str = "weekly_check";
pub const WATER_RECORD: &str = "water_record";
pub const INVENTORY_ITEM: &str = "inventory_item";
pub const EXPENSE: &str = "expense";
pub const KPI_TARGET: &str = "kpi_target";

// Spreadsheet serial dates count days from 1899-12-30. Anything below the
// threshold is treated as an ordinary number, never as a date.
pub const SERIAL_DATE_THRESHOLD: f64 = 40_000.0;
// 9999-12-31
pub const SERIAL_DATE_MAX: f64 = 2_958_465.0;

/// Cell contents that mean "no value" in hand-edited sheets.
pub const NULL_TOKENS: &[&str] = &["", "nan", "none", "null", "n/a", "na", "-"];

pub const DEFAULT_CHUNK_SIZE: usize = 5000;
pub const DEFAULT_MAX_RETRIES: u32 = 3;
pub const DEFAULT_RETRY_DELAY_MS: u64 = 5000;
pub const MAX_RETRY_DELAY_MS: u64 = 60_000;
pub const DEFAULT_FAILURE_RATE_THRESHOLD: f64 = 0.8;
pub const DEFAULT_POOL_SIZE: usize = 4;
pub const DEFAULT_BUSY_TIMEOUT_MS: u64 = 5000;

/// Check whether a trimmed cell is one of the null tokens (case-insensitive).
pub fn is_null_token(s: &str) -> bool {
    let lowered = s.trim().to_lowercase();
    NULL_TOKENS.contains(&lowered.as_str())
}
