//! Worker pool. Each worker is one tokio task that owns its connections outright and
//! runs every drain and tick for them, so per-connection work is strictly sequential.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use kcp_core::{CloseReason, Connection, SessionKey, SessionManager, Stats, Tick, TimerQueue};
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::listener::{self, Listener};
use crate::session::Session;
use crate::transport::{Link, UdpOutput};

pub type SessionTable = SessionManager<Arc<Session>>;

/// Millisecond clock shared by every connection of a pool. Wraps at 2^32.
#[derive(Debug, Clone, Copy)]
pub struct Clock {
    origin: Instant,
}

impl Clock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }

    pub fn now_ms(&self) -> u32 {
        self.origin.elapsed().as_millis() as u32
    }
}

impl Default for Clock {
    fn default() -> Self {
        Self::new()
    }
}

/// Table entry to drop when the connection closes.
pub(crate) struct Registration {
    pub table: Arc<SessionTable>,
    pub key: SessionKey,
}

pub(crate) enum Job {
    Open {
        conn: Box<Connection>,
        session: Arc<Session>,
        listener: Arc<dyn Listener>,
        registration: Option<Registration>,
    },
    Read(u64),
    Write(u64),
    Close(u64),
    Stats(oneshot::Sender<Stats>),
    Shutdown,
}

struct Entry {
    conn: Box<Connection>,
    session: Arc<Session>,
    listener: Arc<dyn Listener>,
    registration: Option<Registration>,
}

struct Worker {
    index: usize,
    clock: Clock,
    jobs: mpsc::UnboundedReceiver<Job>,
    conns: HashMap<u64, Entry>,
    timers: TimerQueue<u64>,
    /// Counters of connections already closed.
    retired: Stats,
}

impl Worker {
    async fn run(mut self) {
        debug!(worker = self.index, "worker started");
        loop {
            let wake = self.timers.next_deadline();
            tokio::select! {
                job = self.jobs.recv() => match job {
                    Some(Job::Shutdown) | None => break,
                    Some(job) => self.handle(job),
                },
                _ = sleep_until(wake) => self.fire_due(),
            }
        }
        let ids: Vec<u64> = self.conns.keys().copied().collect();
        for id in ids {
            self.finish(id, CloseReason::Local);
        }
        debug!(worker = self.index, "worker stopped");
    }

    fn handle(&mut self, job: Job) {
        match job {
            Job::Open {
                conn,
                session,
                listener,
                registration,
            } => self.open(conn, session, listener, registration),
            Job::Read(id) => self.read(id),
            Job::Write(id) => self.write(id),
            Job::Close(id) => self.finish(id, CloseReason::Local),
            Job::Stats(reply) => {
                let mut total = self.retired;
                for entry in self.conns.values() {
                    total.merge(entry.conn.stats());
                }
                let _ = reply.send(total);
            }
            Job::Shutdown => {}
        }
    }

    fn open(
        &mut self,
        conn: Box<Connection>,
        session: Arc<Session>,
        listener: Arc<dyn Listener>,
        registration: Option<Registration>,
    ) {
        let id = session.id();
        info!(
            worker = self.index,
            session = id,
            conv = conn.conv(),
            peer = %session.peer(),
            "connection opened"
        );
        listener::guarded(listener.as_ref(), &session, || {
            listener.on_connected(&session)
        });
        self.conns.insert(
            id,
            Entry {
                conn,
                session,
                listener,
                registration,
            },
        );
        self.timers.schedule(id, Instant::now());
    }

    fn read(&mut self, id: u64) {
        let now = self.clock.now_ms();
        let Some(entry) = self.conns.get_mut(&id) else {
            return;
        };
        let link = entry.session.link();
        let messages = entry.conn.drain_reads(now, &mut UdpOutput::new(&link));
        for message in messages {
            listener::guarded(entry.listener.as_ref(), &entry.session, || {
                entry.listener.on_receive(&entry.session, message)
            });
        }
        if entry.session_has_writes() && entry.conn.can_send() {
            entry.drain_writes(now, &link);
        }
    }

    fn write(&mut self, id: u64) {
        let now = self.clock.now_ms();
        if let Some(entry) = self.conns.get_mut(&id) {
            let link = entry.session.link();
            entry.drain_writes(now, &link);
        }
    }

    fn fire_due(&mut self) {
        let now = Instant::now();
        while let Some(id) = self.timers.pop_due(now) {
            self.tick(id);
        }
    }

    fn tick(&mut self, id: u64) {
        let now = self.clock.now_ms();
        let Some(entry) = self.conns.get_mut(&id) else {
            return;
        };
        let link = entry.session.link();
        match entry.conn.tick(now, &mut UdpOutput::new(&link)) {
            Tick::Rearm(delay) => self
                .timers
                .schedule(id, Instant::now() + Duration::from_millis(u64::from(delay))),
            Tick::Closed(reason) => self.finish(id, reason),
        }
    }

    fn finish(&mut self, id: u64, reason: CloseReason) {
        self.timers.cancel(&id);
        let Some(mut entry) = self.conns.remove(&id) else {
            return;
        };
        entry.conn.close();
        self.retired.merge(entry.conn.stats());
        if let Some(reg) = &entry.registration {
            let current = reg.table.get_key(&reg.key);
            if current.is_some_and(|s| Arc::ptr_eq(&s, &entry.session)) {
                reg.table.remove(&reg.key);
            }
        }
        info!(
            worker = self.index,
            session = id,
            conv = entry.conn.conv(),
            ?reason,
            "connection closed"
        );
        listener::closed(entry.listener.as_ref(), &entry.session);
    }
}

impl Entry {
    fn session_has_writes(&self) -> bool {
        self.conn.mailbox().pending_writes() > 0
    }

    fn drain_writes(&mut self, now: u32, link: &Link) {
        if let Err(e) = self.conn.drain_writes(now, &mut UdpOutput::new(link)) {
            warn!(session = self.session.id(), error = %e, "payload rejected");
            listener::report(self.listener.as_ref(), &self.session, e.into());
        }
    }
}

async fn sleep_until(wake: Option<Instant>) {
    match wake {
        Some(at) => tokio::time::sleep_until(tokio::time::Instant::from_std(at)).await,
        None => std::future::pending().await,
    }
}

/// Fixed set of workers. Connections are pinned round-robin when opened.
pub struct WorkerPool {
    senders: Vec<mpsc::UnboundedSender<Job>>,
    handles: Mutex<Vec<JoinHandle<()>>>,
    next_worker: AtomicUsize,
    next_id: AtomicU64,
    clock: Clock,
}

impl WorkerPool {
    /// Spawn `workers` tasks (at least one) on the current runtime.
    pub fn new(workers: usize) -> Self {
        let clock = Clock::new();
        let workers = workers.max(1);
        let mut senders = Vec::with_capacity(workers);
        let mut handles = Vec::with_capacity(workers);
        for index in 0..workers {
            let (tx, rx) = mpsc::unbounded_channel();
            let worker = Worker {
                index,
                clock,
                jobs: rx,
                conns: HashMap::new(),
                timers: TimerQueue::new(),
                retired: Stats::default(),
            };
            handles.push(tokio::spawn(worker.run()));
            senders.push(tx);
        }
        Self {
            senders,
            handles: Mutex::new(handles),
            next_worker: AtomicUsize::new(0),
            next_id: AtomicU64::new(1),
            clock,
        }
    }

    pub fn size(&self) -> usize {
        self.senders.len()
    }

    pub fn now_ms(&self) -> u32 {
        self.clock.now_ms()
    }

    /// Hand `conn` to the next worker and return its session handle.
    pub(crate) fn open(
        &self,
        conn: Connection,
        link: Link,
        listener: Arc<dyn Listener>,
        registration: Option<Registration>,
    ) -> Arc<Session> {
        let index = self.next_worker.fetch_add(1, Ordering::Relaxed) % self.senders.len();
        let sender = &self.senders[index];
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let session = Arc::new(Session::new(
            id,
            Arc::clone(conn.mailbox()),
            link,
            sender.clone(),
        ));
        let job = Job::Open {
            conn: Box::new(conn),
            session: Arc::clone(&session),
            listener,
            registration,
        };
        if sender.send(job).is_err() {
            warn!(session = id, "worker gone, connection dropped");
        }
        session
    }

    /// Counters summed over every connection, closed ones included.
    pub async fn stats(&self) -> Stats {
        let mut total = Stats::default();
        for sender in &self.senders {
            let (tx, rx) = oneshot::channel();
            if sender.send(Job::Stats(tx)).is_err() {
                continue;
            }
            if let Ok(stats) = rx.await {
                total.merge(&stats);
            }
        }
        total
    }

    /// Close every connection (firing `on_closed`) and wait for the workers to stop.
    pub async fn shutdown(&self) {
        for sender in &self.senders {
            let _ = sender.send(Job::Shutdown);
        }
        let handles = std::mem::take(&mut *self.handles.lock());
        for handle in handles {
            if let Err(e) = handle.await {
                warn!(error = %e, "worker task failed");
            }
        }
    }
}
