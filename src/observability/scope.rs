//! Begin/complete logging around multi-step operations

use std::time::Instant;

use super::logger::Logger;

/// Logs `{name}_BEGIN` when created and exactly one of `{name}_COMPLETE`,
/// `{name}_ERROR` or `{name}_INCOMPLETE` when it ends. The closing line
/// carries `elapsed_ms` and the fields given at creation.
pub struct ObservationScope {
    name: &'static str,
    fields: Vec<(&'static str, String)>,
    started: Instant,
    resolved: bool,
}

impl ObservationScope {
    pub fn new(name: &'static str) -> Self {
        Self::with_fields(name, &[])
    }

    pub fn with_fields(name: &'static str, fields: &[(&'static str, &str)]) -> Self {
        Logger::info(&format!("{}_BEGIN", name), fields);
        Self {
            name,
            fields: fields.iter().map(|(k, v)| (*k, v.to_string())).collect(),
            started: Instant::now(),
            resolved: false,
        }
    }

    pub fn complete(mut self) {
        self.resolved = true;
        self.close("COMPLETE", None);
    }

    pub fn fail(mut self, reason: &str) {
        self.resolved = true;
        self.close("ERROR", Some(reason));
    }

    pub fn elapsed_ms(&self) -> u128 {
        self.started.elapsed().as_millis()
    }

    fn close(&self, suffix: &str, reason: Option<&str>) {
        let elapsed = self.elapsed_ms().to_string();
        let mut fields: Vec<(&str, &str)> =
            self.fields.iter().map(|(k, v)| (*k, v.as_str())).collect();
        fields.push(("elapsed_ms", elapsed.as_str()));
        if let Some(reason) = reason {
            fields.push(("reason", reason));
        }

        let event = format!("{}_{}", self.name, suffix);
        match suffix {
            "COMPLETE" => Logger::info(&event, &fields),
            "ERROR" => Logger::error(&event, &fields),
            _ => Logger::warn(&event, &fields),
        }
    }
}

impl Drop for ObservationScope {
    fn drop(&mut self) {
        if !self.resolved {
            self.close("INCOMPLETE", Some("dropped before completion"));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scope_resolves_once() {
        let scope = ObservationScope::with_fields("RECONNECT", &[("generation", "2")]);
        assert!(!scope.resolved);
        scope.complete();

        ObservationScope::new("RECONNECT").fail("transport refused");
    }

    #[test]
    fn test_dropped_scope_logs_incomplete() {
        let scope = ObservationScope::new("RECONNECT");
        assert!(scope.elapsed_ms() < 60_000);
        drop(scope);
    }
}
