//! Distributed dispatch over a plain TCP work queue.
//!
//! The engine binds a port and waits for workers to connect; each connected
//! worker is served jobs one at a time. The wire protocol is line-delimited
//! JSON:
//!
//! - engine -> worker: `{"handle", "id", "files": [[name, contents], ...]}`
//!   — the same files a local process job would get on disk.
//! - worker -> engine: `{"handle", "ok", "coords": [...bohr...], "energy"}`
//!
//! A worker whose connection drops mid-job puts the job back at the front of
//! the queue; another worker picks it up. The scanner never learns any of
//! this — it just sees handles becoming ready.

use std::collections::{HashMap, VecDeque};
use std::io::{BufRead, BufReader, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::mpsc::{Receiver, Sender, channel};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use loaders::template::InputTemplate;

use crate::E;
use crate::config::EngineKind;
use crate::geometry::Geometry;
use crate::scan::state::{Job, ResultRecord};

use super::{EngineError, JobHandle, Optimizer, qm};

const IDLE_WAIT: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Serialize, Deserialize)]
struct WireJob {
    handle: JobHandle,
    id: String,
    files: Vec<(String, String)>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct WireResult {
    handle: JobHandle,
    ok: bool,
    #[serde(default)]
    coords: Vec<E>,
    #[serde(default)]
    energy: Option<E>,
}

pub struct WorkQueueEngine {
    kind: EngineKind,
    template: InputTemplate,
    dihedrals: Vec<[usize; 4]>,
    native_opt: bool,
    extra_constraints: Option<String>,
    port: u16,
    queue: Arc<Mutex<VecDeque<WireJob>>>,
    done_rx: Receiver<WireResult>,
    starts: HashMap<JobHandle, Geometry>,
    ready: HashMap<JobHandle, WireResult>,
    next_handle: JobHandle,
}

impl WorkQueueEngine {
    /// Binds `port` (0 picks an ephemeral port) and starts accepting
    /// workers.
    pub fn bind(
        port: u16,
        kind: EngineKind,
        template: InputTemplate,
        dihedrals: Vec<[usize; 4]>,
    ) -> Result<Self, EngineError> {
        let listener = TcpListener::bind(("0.0.0.0", port))?;
        let port = listener
            .local_addr()
            .map(|addr| addr.port())
            .unwrap_or(port);
        info!("work queue listening on port {port}");

        let queue: Arc<Mutex<VecDeque<WireJob>>> = Arc::new(Mutex::new(VecDeque::new()));
        let (done_tx, done_rx) = channel();

        {
            let queue = queue.clone();
            thread::spawn(move || {
                for stream in listener.incoming() {
                    match stream {
                        Ok(stream) => {
                            let peer = stream
                                .peer_addr()
                                .map(|a| a.to_string())
                                .unwrap_or_else(|_| "?".to_string());
                            info!("worker connected from {peer}");
                            let queue = queue.clone();
                            let done = done_tx.clone();
                            thread::spawn(move || serve_worker(stream, queue, done));
                        }
                        Err(err) => warn!("failed worker connection: {err}"),
                    }
                }
            });
        }

        Ok(WorkQueueEngine {
            kind,
            template,
            dihedrals,
            native_opt: false,
            extra_constraints: None,
            port,
            queue,
            done_rx,
            starts: HashMap::new(),
            ready: HashMap::new(),
            next_handle: 0,
        })
    }

    pub fn with_native_opt(mut self, native_opt: bool) -> Self {
        self.native_opt = native_opt;
        self
    }

    pub fn with_extra_constraints(mut self, extra: Option<String>) -> Self {
        self.extra_constraints = extra;
        self
    }

    /// The bound port (useful when constructed with port 0).
    pub fn port(&self) -> u16 {
        self.port
    }
}

impl Optimizer for WorkQueueEngine {
    fn submit(&mut self, job: &Job) -> Result<JobHandle, EngineError> {
        let handle = self.next_handle;
        self.next_handle += 1;

        let files = qm::job_files(
            self.kind,
            &self.template,
            &self.dihedrals,
            self.native_opt,
            self.extra_constraints.as_deref(),
            job,
        );
        let wire = WireJob {
            handle,
            id: job.id.clone(),
            files,
        };
        self.starts.insert(handle, job.start.clone());
        self.queue
            .lock()
            .map_err(|_| EngineError::WorkQueue {
                message: "queue lock poisoned".to_string(),
            })?
            .push_back(wire);
        Ok(handle)
    }

    fn poll_ready(&mut self) -> Vec<JobHandle> {
        for result in self.done_rx.try_iter() {
            self.ready.insert(result.handle, result);
        }
        let mut handles: Vec<JobHandle> = self.ready.keys().copied().collect();
        handles.sort_unstable();
        handles
    }

    fn collect(&mut self, handle: JobHandle) -> ResultRecord {
        let start = self
            .starts
            .remove(&handle)
            .expect("collect of an unknown handle");
        let Some(result) = self.ready.remove(&handle) else {
            return ResultRecord::failed(start);
        };
        if !result.ok {
            return ResultRecord::failed(start);
        }
        let (Some(energy), true) = (result.energy, result.coords.len() == start.coords().len())
        else {
            warn!("worker result for handle {handle} is malformed");
            return ResultRecord::failed(start);
        };
        match Geometry::new(result.coords) {
            Ok(final_geometry) => ResultRecord::ok(start, final_geometry, energy),
            Err(_) => ResultRecord::failed(start),
        }
    }

    fn capacity(&self) -> Option<usize> {
        // The queue buffers everything; workers pace consumption.
        None
    }
}

/// Serves one worker connection: pop a job, ship it, wait for the reply. A
/// broken connection requeues the in-flight job and ends the thread.
fn serve_worker(
    stream: TcpStream,
    queue: Arc<Mutex<VecDeque<WireJob>>>,
    done: Sender<WireResult>,
) {
    let mut writer = match stream.try_clone() {
        Ok(w) => w,
        Err(err) => {
            warn!("could not clone worker stream: {err}");
            return;
        }
    };
    let mut reader = BufReader::new(stream);

    loop {
        let job = loop {
            let popped = match queue.lock() {
                Ok(mut q) => q.pop_front(),
                Err(_) => return,
            };
            match popped {
                Some(job) => break job,
                None => thread::sleep(IDLE_WAIT),
            }
        };

        debug!("shipping job {} to worker", &job.id[..12.min(job.id.len())]);
        match exchange(&mut writer, &mut reader, &job) {
            Ok(result) => {
                if done.send(result).is_err() {
                    // Engine is gone; nothing left to do.
                    return;
                }
            }
            Err(err) => {
                warn!("worker dropped mid-job, requeueing: {err}");
                if let Ok(mut q) = queue.lock() {
                    q.push_front(job);
                }
                return;
            }
        }
    }
}

fn exchange(
    writer: &mut TcpStream,
    reader: &mut BufReader<TcpStream>,
    job: &WireJob,
) -> std::io::Result<WireResult> {
    let line = serde_json::to_string(job).map_err(std::io::Error::other)?;
    writer.write_all(line.as_bytes())?;
    writer.write_all(b"\n")?;
    writer.flush()?;

    let mut reply = String::new();
    if reader.read_line(&mut reply)? == 0 {
        return Err(std::io::Error::other("worker closed the connection"));
    }
    serde_json::from_str(&reply).map_err(std::io::Error::other)
}

#[cfg(test)]
mod tests {
    use crate::grid::GridPoint;
    use crate::scan::state::JobStatus;
    use loaders::template::{TemplateFormat, parse_single_file};

    use super::*;

    static PSI4: &str = "molecule {\n0 1\nH -0.9 1.65 0.0\nO 0.0 0.0 0.0\nO 2.75 0.0 0.0\nH 3.65 1.65 0.0\n}\noptimize('scf')\n";

    /// A worker that "optimizes" by echoing the start geometry at a fixed
    /// energy.
    fn spawn_fake_worker(port: u16, energy: E) {
        thread::spawn(move || {
            let stream = TcpStream::connect(("127.0.0.1", port)).unwrap();
            let mut writer = stream.try_clone().unwrap();
            let mut reader = BufReader::new(stream);
            loop {
                let mut line = String::new();
                if reader.read_line(&mut line).unwrap_or(0) == 0 {
                    return;
                }
                let job: WireJob = serde_json::from_str(&line).unwrap();
                let reply = WireResult {
                    handle: job.handle,
                    ok: true,
                    coords: vec![0.5; 12],
                    energy: Some(energy),
                };
                let text = serde_json::to_string(&reply).unwrap();
                writer.write_all(text.as_bytes()).unwrap();
                writer.write_all(b"\n").unwrap();
                writer.flush().unwrap();
            }
        });
    }

    #[test]
    fn jobs_round_trip_through_a_worker() {
        let template = parse_single_file(PSI4, "test", TemplateFormat::Psi4).unwrap();
        let mut engine =
            WorkQueueEngine::bind(0, EngineKind::Psi4, template, vec![[0, 1, 2, 3]]).unwrap();
        spawn_fake_worker(engine.port(), -2.5);

        let job = Job::new(
            Geometry::new(vec![0.25; 12]).unwrap(),
            GridPoint::new(vec![60]),
        );
        let handle = engine.submit(&job).unwrap();

        let mut ready = Vec::new();
        for _ in 0..500 {
            ready = engine.poll_ready();
            if !ready.is_empty() {
                break;
            }
            thread::sleep(Duration::from_millis(20));
        }
        assert_eq!(ready, [handle]);

        let record = engine.collect(handle);
        assert_eq!(record.status, JobStatus::Ok);
        assert_eq!(record.final_energy, Some(-2.5));
        assert_eq!(record.final_geometry.coords(), [0.5; 12]);
    }
}
