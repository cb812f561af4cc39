pub mod config;
pub mod dispatcher;
pub mod error;
pub mod events;
pub mod identity;
pub mod model;
pub mod relay;
pub mod server;
pub mod store;

// Test-only printing helper: expands to eprintln! in debug and test builds.
// Usage: tprintln!("debug: {}", value);
#[cfg(any(test, debug_assertions))]
#[macro_export]
macro_rules! tprintln {
    ($($arg:tt)*) => ( eprintln!($($arg)*) );
}

// In release builds tprintln! is a no-op that still type-checks its arguments.
#[cfg(not(any(test, debug_assertions)))]
#[macro_export]
macro_rules! tprintln {
    ($($arg:tt)*) => ({
        if false { let _ = format!($($arg)*); }
    });
}
