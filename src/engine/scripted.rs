//! A deterministic in-process backend.
//!
//! The "optimization" is whatever closure the caller provides; results are
//! ready as soon as they are submitted. The test suite and the benches use
//! it to script energy surfaces, ties, and failures; it is also a handy dry
//! run backend for exercising a scan setup without a QM program.

use std::collections::VecDeque;

use crate::scan::state::{Job, ResultRecord};

use super::{EngineError, JobHandle, Optimizer};

pub struct ScriptedEngine {
    script: Box<dyn FnMut(&Job) -> ResultRecord>,
    ready: VecDeque<(JobHandle, ResultRecord)>,
    next_handle: JobHandle,
}

impl ScriptedEngine {
    pub fn new(script: impl FnMut(&Job) -> ResultRecord + 'static) -> Self {
        ScriptedEngine {
            script: Box::new(script),
            ready: VecDeque::new(),
            next_handle: 0,
        }
    }
}

impl Optimizer for ScriptedEngine {
    fn submit(&mut self, job: &Job) -> Result<JobHandle, EngineError> {
        let handle = self.next_handle;
        self.next_handle += 1;
        let record = (self.script)(job);
        self.ready.push_back((handle, record));
        Ok(handle)
    }

    fn poll_ready(&mut self) -> Vec<JobHandle> {
        self.ready.iter().map(|(handle, _)| *handle).collect()
    }

    fn collect(&mut self, handle: JobHandle) -> ResultRecord {
        let position = self
            .ready
            .iter()
            .position(|(h, _)| *h == handle)
            .expect("collect of a handle that is not ready");
        self.ready.remove(position).expect("position is valid").1
    }

    fn capacity(&self) -> Option<usize> {
        None
    }
}
