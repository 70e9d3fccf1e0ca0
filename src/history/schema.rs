//! Diesel table definitions for the history store.
//!
//! Timestamps are stored as RFC 3339 text (see `models::format_datetime`)
//! rather than relying on diesel's native `Timestamp` mapping.

diesel::table! {
    runs (id) {
        id -> Text,
        host -> Text,
        user -> Text,
        config_fingerprint -> Text,
        start_time -> Text,
        end_time -> Nullable<Text>,
        total -> Integer,
        succeeded -> Integer,
        failed -> Integer,
        skipped -> Integer,
    }
}

diesel::table! {
    plugin_executions (id) {
        id -> Text,
        run_id -> Text,
        plugin_name -> Text,
        status -> Text,
        start_time -> Nullable<Text>,
        end_time -> Nullable<Text>,
        packages_updated -> Integer,
        exit_code -> Nullable<Integer>,
        error_message -> Nullable<Text>,
    }
}

diesel::table! {
    step_metrics (id) {
        id -> Integer,
        execution_id -> Text,
        step_name -> Text,
        phase -> Text,
        start_time -> Text,
        end_time -> Text,
        wall_clock_seconds -> Double,
        cpu_user_seconds -> Double,
        cpu_kernel_seconds -> Double,
        peak_memory_bytes -> BigInt,
        avg_memory_bytes -> BigInt,
        io_read_bytes -> BigInt,
        io_write_bytes -> BigInt,
        io_read_ops -> BigInt,
        io_write_ops -> BigInt,
        net_rx_bytes -> BigInt,
        net_tx_bytes -> BigInt,
        download_size_bytes -> Nullable<BigInt>,
        download_speed_bps -> Nullable<Double>,
    }
}

diesel::table! {
    estimates (id) {
        id -> Integer,
        execution_id -> Text,
        phase -> Text,
        download_bytes -> Nullable<BigInt>,
        cpu_seconds -> Nullable<Double>,
        wall_seconds -> Nullable<Double>,
        memory_bytes -> Nullable<BigInt>,
        package_count -> Nullable<Integer>,
        confidence -> Nullable<Double>,
    }
}

diesel::joinable!(plugin_executions -> runs (run_id));
diesel::joinable!(step_metrics -> plugin_executions (execution_id));
diesel::joinable!(estimates -> plugin_executions (execution_id));

diesel::allow_tables_to_appear_in_same_query!(
    runs,
    plugin_executions,
    step_metrics,
    estimates,
);
