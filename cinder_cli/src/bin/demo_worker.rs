//! Example worker: a JSON-ish target with planted bugs.
//!
//! Run it under the orchestrator with `cinder -- ./target/release/demo_worker`.

use cinder_core::coverage::CoverageMap;
use cinder_core::protocol::WorkResult;
use cinder_core::runtime::{self, Target, WorkerOptions};
use serde_json::Value;
use std::process::ExitCode;
use std::thread;
use std::time::Duration;

/// Edge ids below this are reserved for the fixed checks in `run`.
const FIRST_VALUE_EDGE: usize = 64;
const MAX_DEPTH: usize = 32;

struct DemoTarget {
    /// Set when `serde_json` is excluded from instrumentation.
    shallow: bool,
}

impl DemoTarget {
    fn walk(value: &Value, depth: usize, coverage: &mut CoverageMap) {
        let kind = match value {
            Value::Null => 0,
            Value::Bool(_) => 1,
            Value::Number(_) => 2,
            Value::String(_) => 3,
            Value::Array(_) => 4,
            Value::Object(_) => 5,
        };
        let depth = depth.min(MAX_DEPTH);
        coverage.hit(FIRST_VALUE_EDGE + depth * 8 + kind);
        match value {
            Value::Array(items) => {
                for item in items {
                    Self::walk(item, depth + 1, coverage);
                }
            }
            Value::Object(fields) => {
                for (key, item) in fields {
                    if key == "admin" && item == &Value::Bool(true) {
                        coverage.hit(7);
                    }
                    Self::walk(item, depth + 1, coverage);
                }
            }
            _ => {}
        }
    }
}

impl Target for DemoTarget {
    fn run(&mut self, data: &[u8], coverage: &mut CoverageMap) -> Result<WorkResult, String> {
        coverage.hit(0);
        if data.first() == Some(&b'B') {
            coverage.hit(1);
            if data.get(1) == Some(&b'A') {
                coverage.hit(2);
                if data.get(2) == Some(&b'D') {
                    panic!("BAD input detected by harness!");
                }
            }
        }
        if data.starts_with(b"CRAS") {
            return Err("CRASH input detected by harness!".to_string());
        }
        if data.windows(4).any(|w| w == b"HANG") {
            loop {
                thread::sleep(Duration::from_secs(1));
            }
        }
        if self.shallow {
            return Ok(WorkResult::Allow);
        }

        match serde_json::from_slice::<Value>(data) {
            Ok(value) => {
                coverage.hit(3);
                Self::walk(&value, 0, coverage);
                Ok(WorkResult::Reinforce)
            }
            Err(e) => {
                coverage.hit(10 + e.classify() as usize);
                Ok(WorkResult::Allow)
            }
        }
    }

    fn literals(&self) -> Vec<String> {
        ["null", "true", "false", "\"admin\"", "HANG", "CRAS"]
            .into_iter()
            .map(String::from)
            .collect()
    }
}

fn main() -> ExitCode {
    runtime::run_worker(|options: &WorkerOptions| {
        let shallow = options.is_excluded("serde_json");
        if shallow {
            log::info!("serde_json excluded, running the shallow target");
        }
        Ok(DemoTarget { shallow })
    })
}
