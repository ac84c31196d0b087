//! Shared helpers: logging and progress display

pub mod logging;

pub use logging::{
    add_group_progress_bar, create_multi_progress, finish_progress_bar, log_operation_complete, log_operation_start,
    log_warning,
};
