pub mod http;
pub mod metrics_defs;

/// Record against a counter declared as a [`metrics_defs::MetricDef`].
///
/// ```ignore
/// counter!(FORWARD_REQUESTS_TOTAL, "result" => "success").increment(1);
/// ```
#[macro_export]
macro_rules! counter {
    ($def:expr) => {
        ::metrics::counter!($def.name)
    };
    ($def:expr, $($key:expr => $value:expr),+ $(,)?) => {
        ::metrics::counter!($def.name, $($key => $value),+)
    };
}
