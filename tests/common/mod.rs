#![allow(dead_code)]

use report_render::{
    converter::{ConvertError, Converter, ConverterResult, Document, Strategy},
    util::CancelToken,
};
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Clone)]
pub enum Behavior {
    Succeed(Vec<u8>),
    Empty,
    Fail,
    Slow(Duration),
}

/// Scripted converter that records every invocation in a shared log.
pub struct FakeConverter {
    pub strategy: Strategy,
    pub available: bool,
    pub behavior: Behavior,
    pub calls: Arc<Mutex<Vec<Strategy>>>,
}

impl FakeConverter {
    pub fn new(strategy: Strategy, behavior: Behavior, calls: &Arc<Mutex<Vec<Strategy>>>) -> Self {
        Self {
            strategy,
            available: true,
            behavior,
            calls: Arc::clone(calls),
        }
    }

    pub fn unavailable(mut self) -> Self {
        self.available = false;
        self
    }

    pub fn boxed(self) -> Box<dyn Converter> {
        Box::new(self)
    }
}

impl Converter for FakeConverter {
    fn strategy(&self) -> Strategy {
        self.strategy
    }

    fn is_available(&self) -> bool {
        self.available
    }

    fn convert(&self, _source: &str, _cancel: &CancelToken) -> ConverterResult {
        self.calls.lock().unwrap().push(self.strategy);
        match &self.behavior {
            Behavior::Succeed(bytes) => Ok(Document {
                bytes: bytes.clone(),
                producer: self.strategy,
            }),
            Behavior::Empty => Ok(Document {
                bytes: Vec::new(),
                producer: self.strategy,
            }),
            Behavior::Fail => Err(ConvertError::RenderFailed("scripted failure".into())),
            Behavior::Slow(d) => {
                std::thread::sleep(*d);
                Err(ConvertError::ProcessTimedOut {
                    program: "fake".into(),
                    seconds: d.as_secs(),
                    stderr: String::new(),
                })
            }
        }
    }
}

pub fn call_log() -> Arc<Mutex<Vec<Strategy>>> {
    Arc::new(Mutex::new(Vec::new()))
}
