use std::fmt;
use std::sync::Arc;

use wily_core::{BoundId, Dtab, Error, Path};

/// Annotation keys recorded against the current trace context.
pub const PATH_KEY: &str = "wily.path";
pub const DTAB_BASE_KEY: &str = "wily.dtab.base";
pub const DTAB_LOCAL_KEY: &str = "wily.dtab.local";
pub const NAME_KEY: &str = "wily.name";
pub const FAILURE_KEY: &str = "wily.failure";

/// The injected annotation callback. The core does not own a tracing
/// backend.
pub type TraceSink = Arc<dyn Fn(&str, String) + Send + Sync>;

/// Records how one path resolved under one delegation-table pair.
///
/// Every outcome annotation is accompanied by the path and both tables, so
/// a span can be read on its own.
#[derive(Clone)]
pub struct NameTracer {
    path: Path,
    base: Dtab,
    local: Dtab,
    sink: TraceSink,
}

impl NameTracer {
    pub fn new(path: Path, base: Dtab, local: Dtab, sink: TraceSink) -> Self {
        NameTracer {
            path,
            base,
            local,
            sink,
        }
    }

    /// Annotates a request that was dispatched to a bound name.
    pub fn record_bound(&self, id: &BoundId) {
        self.context();
        (self.sink)(NAME_KEY, id.to_string());
    }

    /// Annotates a request that failed to bind.
    pub fn record_failure(&self, err: &Error) {
        self.context();
        (self.sink)(FAILURE_KEY, err.label());
    }

    fn context(&self) {
        (self.sink)(PATH_KEY, self.path.to_string());
        (self.sink)(DTAB_BASE_KEY, self.base.to_string());
        (self.sink)(DTAB_LOCAL_KEY, self.local.to_string());
    }
}

impl fmt::Debug for NameTracer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NameTracer")
            .field("path", &self.path)
            .field("base", &self.base)
            .field("local", &self.local)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use parking_lot::Mutex;

    #[test]
    fn annotations_carry_context() {
        let records = Arc::new(Mutex::new(Vec::new()));
        let sink: TraceSink = {
            let records = records.clone();
            Arc::new(move |key, value| records.lock().push((key.to_string(), value)))
        };

        let path: Path = "/s/foo".parse().unwrap();
        let tracer = NameTracer::new(path.clone(), Dtab::empty(), Dtab::empty(), sink);

        tracer.record_bound(&BoundId::Path(path));
        tracer.record_failure(&Error::ServiceClosed);

        let records = records.lock();
        let keys: Vec<&str> = records.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(
            keys,
            vec![
                PATH_KEY,
                DTAB_BASE_KEY,
                DTAB_LOCAL_KEY,
                NAME_KEY,
                PATH_KEY,
                DTAB_BASE_KEY,
                DTAB_LOCAL_KEY,
                FAILURE_KEY,
            ]
        );
        assert_eq!(records[3].1, "/s/foo");
        assert_eq!(records[7].1, "ServiceClosed");
    }
}
