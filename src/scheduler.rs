use chrono::Local;
use log::{debug, error, info, trace, warn};
use std::collections::HashMap;
use std::fs;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;

use crate::artifact::ArtifactWriter;
use crate::codec::SensorId;
use crate::logger::LogHandle;
use crate::plan::{PlanDocument, PlanStore};
use crate::queue::{Command, CommandQueue, QueueMessage};
use crate::sensor::{Measurement, Sensor, SweepParams, SweepShape, TofParams};
use crate::transport::BusLink;
use crate::watcher::{self, METADATA_FLAG, SETTINGS_FLAG};

smlang::statemachine! {
    name: Cycle,
    derive_states: [Debug, Clone],
    derive_events: [Debug, Clone],
    transitions: {
        *Idle + Tick = Draining,
        Draining + QueueEmpty = Reseeding,
        Reseeding + Seeded = Idle,
    }
}

pub struct CycleContext {
    log_key: String,
}

impl CycleStateMachineContext for CycleContext {
    fn log_process_event(&self, current_state: &CycleStates, event: &CycleEvents) {
        trace!(target: &self.log_key, "[{:?}] processing event {:?}", current_state, event);
    }
}

/// What wakes the scheduler between cycles.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WakeEvent {
    CycleDue,
    Midnight,
    Shutdown,
}

/// Which plan the next cycle runs.
#[derive(Debug, Clone, PartialEq, Eq)]
enum PlanChoice {
    Default,
    Sub(String),
}

/// A cycle that ran for `elapsed` waits out the remainder of its interval.
pub fn next_cycle_delay(interval: Duration, elapsed: Duration) -> Duration {
    interval.saturating_sub(elapsed)
}

fn until_local_midnight() -> Duration {
    let now = Local::now();
    let next = now
        .date_naive()
        .succ_opt()
        .map(|d| d.and_time(chrono::NaiveTime::MIN))
        .unwrap_or_else(|| now.naive_local());
    (next - now.naive_local())
        .to_std()
        .unwrap_or(Duration::from_secs(1))
}

/// Sleeps until the published cycle deadline or local midnight, whichever
/// comes first, and re-awakens the scheduler. Suspends on sleeps only, never
/// on the bus.
pub async fn cadence_task(mut deadline: watch::Receiver<Instant>, events: mpsc::Sender<WakeEvent>) {
    loop {
        let due = *deadline.borrow_and_update();
        tokio::select! {
            _ = tokio::time::sleep_until(due) => {
                if events.send(WakeEvent::CycleDue).await.is_err() {
                    return;
                }
                // wait for the next published deadline, still minding midnight
                loop {
                    tokio::select! {
                        changed = deadline.changed() => {
                            if changed.is_err() {
                                return;
                            }
                            break;
                        }
                        _ = tokio::time::sleep(until_local_midnight()) => {
                            if events.send(WakeEvent::Midnight).await.is_err() {
                                return;
                            }
                        }
                    }
                }
            }
            _ = tokio::time::sleep(until_local_midnight()) => {
                if events.send(WakeEvent::Midnight).await.is_err() {
                    return;
                }
            }
            changed = deadline.changed() => {
                if changed.is_err() {
                    return;
                }
            }
        }
    }
}

/// The driver loop. Owns the bus link and the sensor roster; the only task
/// that issues exchanges.
pub struct Scheduler {
    bus: Box<dyn BusLink>,
    queue: Arc<CommandQueue>,
    store: PlanStore,
    artifacts: ArtifactWriter,
    document: PlanDocument,
    sensors: Vec<Sensor>,
    current_plan: PlanChoice,
    default_due: Instant,
    sub_due: HashMap<String, Instant>,
    sm: CycleStateMachine<CycleContext>,
    events: mpsc::Receiver<WakeEvent>,
    deadline: watch::Sender<Instant>,
    shutdown: Arc<AtomicBool>,
    log_handle: Option<LogHandle>,
    log_level: String,
    log_key: String,
}

impl Scheduler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        bus: Box<dyn BusLink>,
        queue: Arc<CommandQueue>,
        store: PlanStore,
        artifacts: ArtifactWriter,
        document: PlanDocument,
        log_handle: Option<LogHandle>,
        events: mpsc::Receiver<WakeEvent>,
        deadline: watch::Sender<Instant>,
        shutdown: Arc<AtomicBool>,
    ) -> Self {
        let sensors = document
            .sensors
            .iter()
            .map(|&id| Sensor::new(id, document.variant_of(id), document.default_damping_of(id)))
            .collect();
        let log_level = document.log_level().to_string();
        Self {
            bus,
            queue,
            store,
            artifacts,
            document,
            sensors,
            current_plan: PlanChoice::Default,
            default_due: Instant::now(),
            sub_due: HashMap::new(),
            sm: CycleStateMachine::new(CycleContext {
                log_key: "scheduler".to_string(),
            }),
            events,
            deadline,
            shutdown,
            log_handle,
            log_level,
            log_key: "scheduler".to_string(),
        }
    }

    pub async fn run(mut self) {
        info!(
            target: &self.log_key,
            "scheduler started with {} sensors, interval {:?}",
            self.sensors.len(),
            self.document.interval()
        );
        self.seed_startup();
        self.cycle().await;
        while let Some(event) = self.events.recv().await {
            if self.shutdown.load(Ordering::Relaxed) {
                break;
            }
            match event {
                WakeEvent::CycleDue => self.cycle().await,
                WakeEvent::Midnight => self.midnight_sweep(),
                WakeEvent::Shutdown => break,
            }
        }
        info!(target: &self.log_key, "scheduler stopped");
    }

    /// First cycle: one probe per configured sensor ahead of the periodic
    /// sequence.
    fn seed_startup(&self) {
        for sensor in &self.sensors {
            self.queue.push_back(QueueMessage::periodic(
                sensor.id,
                Command::Probe {
                    calibrate_after: false,
                },
            ));
        }
        self.seed_current();
    }

    async fn cycle(&mut self) {
        let started = Instant::now();
        let _ = self.sm.process_event(CycleEvents::Tick);
        info!(
            target: &self.log_key,
            "cycle started, queue holds {} messages", self.queue.len()
        );
        self.drain().await;
        if self.shutdown.load(Ordering::Relaxed) {
            return;
        }
        let _ = self.sm.process_event(CycleEvents::QueueEmpty);
        self.reseed(started);
        let _ = self.sm.process_event(CycleEvents::Seeded);
    }

    async fn drain(&mut self) {
        loop {
            if self.shutdown.load(Ordering::Relaxed) {
                info!(target: &self.log_key, "shutdown requested, leaving queue as is");
                return;
            }
            self.scan_sentinels();
            let Some(message) = self.queue.pop() else {
                break;
            };
            self.dispatch(message).await;
        }
    }

    /// Between every two pops: interrupts jump the queue, the two flag files
    /// force a reseed or a roster refresh.
    fn scan_sentinels(&mut self) {
        let dir = self.store.metadata_dir().to_path_buf();
        if let Some(messages) = watcher::claim_interrupts(&dir) {
            for message in messages {
                info!(
                    target: &self.log_key,
                    "interrupt {:?} for {} queued ahead", message.command, message.target
                );
                self.queue.push_front(message);
            }
        }
        let settings_flag = dir.join(SETTINGS_FLAG);
        if settings_flag.exists() {
            info!(target: &self.log_key, "measurement settings changed, resetting queue");
            self.reload_document();
            self.queue.clear();
            self.seed_current();
            if let Err(e) = fs::remove_file(&settings_flag) {
                warn!(target: &self.log_key, "could not remove settings flag: {e}");
            }
        }
        let metadata_flag = dir.join(METADATA_FLAG);
        if metadata_flag.exists() {
            self.refresh_roster();
            if let Err(e) = fs::remove_file(&metadata_flag) {
                warn!(target: &self.log_key, "could not remove metadata flag: {e}");
            }
        }
    }

    fn reload_document(&mut self) {
        let roster: Vec<SensorId> = self.sensors.iter().map(|s| s.id).collect();
        self.document = self.store.load_or_fallback(roster);
        let level = self.document.log_level();
        if level != self.log_level {
            info!(target: &self.log_key, "log level changed to {level}");
            if let Some(handle) = &self.log_handle {
                handle.set_level(level);
            }
            self.log_level = level.to_string();
        }
    }

    /// Apply a changed active-sensor set: drop actors whose id left, probe
    /// and calibrate ids that joined.
    fn refresh_roster(&mut self) {
        self.reload_document();
        let wanted = self.document.sensors.clone();
        self.sensors.retain(|s| {
            let keep = wanted.contains(&s.id);
            if !keep {
                info!(target: &self.log_key, "sensor {} left the active set", s.id);
            }
            keep
        });
        for &id in &wanted {
            if self.sensors.iter().all(|s| s.id != id) {
                info!(target: &self.log_key, "sensor {id} joined the active set");
                self.sensors.push(Sensor::new(
                    id,
                    self.document.variant_of(id),
                    self.document.default_damping_of(id),
                ));
                self.queue.push_front(QueueMessage::recovery(
                    id,
                    Command::Calibrate { measure_after: true },
                ));
                self.queue.push_front(QueueMessage::recovery(
                    id,
                    Command::Probe {
                        calibrate_after: false,
                    },
                ));
            }
        }
    }

    async fn dispatch(&mut self, message: QueueMessage) {
        let Some(index) = self.sensors.iter().position(|s| s.id == message.target) else {
            warn!(
                target: &self.log_key,
                "dropping {:?} for unknown sensor {}", message.command, message.target
            );
            return;
        };
        match message.command.clone() {
            Command::Probe { calibrate_after } => self.handle_probe(index, calibrate_after).await,
            Command::Calibrate { measure_after } => {
                self.handle_calibrate(index, measure_after).await
            }
            Command::SetDamping { level } => {
                if let Err(e) = self.sensors[index]
                    .set_damping(self.bus.as_mut(), Some(level))
                    .await
                {
                    warn!(target: self.sensors[index].log_key(), "set damping failed: {e}");
                }
            }
            Command::MeasureBlock(params) => {
                self.handle_sweep(index, SweepShape::Block, params, &message).await
            }
            Command::MeasureSine(params) => {
                self.handle_sweep(index, SweepShape::Sine, params, &message).await
            }
            Command::MeasureEnv => self.handle_env(index, &message).await,
            Command::MeasureTofImpulse(params) => {
                self.handle_tof(index, params, false, &message).await
            }
            Command::MeasureTofBlock(params) => {
                self.handle_tof(index, params, true, &message).await
            }
            Command::Reset { probe_after } => self.handle_reset(index, probe_after).await,
        }
    }

    async fn handle_probe(&mut self, index: usize, calibrate_after: bool) {
        let id = self.sensors[index].id;
        match self.sensors[index].probe(self.bus.as_mut()).await {
            Ok(()) => {
                self.sensors[index].responsive = true;
                if calibrate_after {
                    self.queue.push_front(QueueMessage::recovery(
                        id,
                        Command::Calibrate { measure_after: true },
                    ));
                }
            }
            Err(e) => {
                warn!(
                    target: self.sensors[index].log_key(),
                    "probe failed ({e}), marking unresponsive"
                );
                self.sensors[index].responsive = false;
            }
        }
    }

    async fn handle_calibrate(&mut self, index: usize, measure_after: bool) {
        let id = self.sensors[index].id;
        match self.sensors[index].calibrate(self.bus.as_mut()).await {
            Ok(()) => {
                self.sensors[index].responsive = true;
                if measure_after {
                    self.queue.push_front(test_measure(id));
                }
            }
            Err(e) => {
                warn!(
                    target: self.sensors[index].log_key(),
                    "calibration failed ({e}), marking unresponsive"
                );
                self.sensors[index].responsive = false;
            }
        }
    }

    async fn handle_sweep(
        &mut self,
        index: usize,
        shape: SweepShape,
        params: SweepParams,
        message: &QueueMessage,
    ) {
        if let Err(e) = self.sensors[index]
            .set_damping(self.bus.as_mut(), params.damping_level)
            .await
        {
            warn!(
                target: self.sensors[index].log_key(),
                "damping refused ({e}), skipping measurement"
            );
            return;
        }
        let outcome = self.sensors[index]
            .measure_sweep(self.bus.as_mut(), shape, &params)
            .await;
        let id = self.sensors[index].id;
        let damping = self.sensors[index].damping_level;
        match outcome {
            Measurement::Complete(samples) => {
                self.persist_audio(id, shape, &params, damping, &samples, message);
            }
            Measurement::Partial(samples) => {
                warn!(target: self.sensors[index].log_key(), "sweep incomplete, keeping partial data");
                self.persist_audio(id, shape, &params, damping, &samples, message);
                self.push_recovery(id);
            }
            Measurement::Failed => {
                warn!(target: self.sensors[index].log_key(), "sweep failed");
                self.push_recovery(id);
            }
        }
    }

    async fn handle_env(&mut self, index: usize, message: &QueueMessage) {
        let id = self.sensors[index].id;
        match self.sensors[index].measure_env(self.bus.as_mut()).await {
            Ok(reading) => {
                if message.test_measure {
                    return;
                }
                if let Err(e) = self
                    .artifacts
                    .write_env(id, &reading, Local::now().naive_local())
                {
                    error!(target: &self.log_key, "failed to persist env for {id}: {e}");
                }
            }
            Err(e) => {
                warn!(target: self.sensors[index].log_key(), "env measurement failed: {e}");
                self.push_recovery(id);
            }
        }
    }

    async fn handle_tof(
        &mut self,
        index: usize,
        params: TofParams,
        block: bool,
        message: &QueueMessage,
    ) {
        if let Err(e) = self.sensors[index]
            .set_damping(self.bus.as_mut(), params.damping_level)
            .await
        {
            warn!(
                target: self.sensors[index].log_key(),
                "damping refused ({e}), skipping measurement"
            );
            return;
        }
        let outcome = self.sensors[index]
            .measure_tof(self.bus.as_mut(), &params, block)
            .await;
        let id = self.sensors[index].id;
        let damping = self.sensors[index].damping_level;
        match outcome {
            Measurement::Complete(counts) => {
                self.persist_tof(id, &params, block, damping, &counts, message);
            }
            Measurement::Partial(counts) => {
                warn!(target: self.sensors[index].log_key(), "tof incomplete, keeping partial data");
                self.persist_tof(id, &params, block, damping, &counts, message);
                self.push_recovery(id);
            }
            Measurement::Failed => {
                warn!(target: self.sensors[index].log_key(), "tof failed");
                self.push_recovery(id);
            }
        }
    }

    async fn handle_reset(&mut self, index: usize, probe_after: bool) {
        let id = self.sensors[index].id;
        match self.sensors[index].reset(self.bus.as_mut()).await {
            Ok(()) => {
                self.sensors[index].responsive = true;
                if probe_after {
                    self.queue.push_front(QueueMessage::recovery(
                        id,
                        Command::Probe {
                            calibrate_after: true,
                        },
                    ));
                }
            }
            Err(e) => {
                warn!(
                    target: self.sensors[index].log_key(),
                    "reset failed ({e}), marking unresponsive"
                );
                self.sensors[index].responsive = false;
            }
        }
    }

    fn persist_audio(
        &self,
        id: SensorId,
        shape: SweepShape,
        params: &SweepParams,
        damping: u16,
        samples: &[i16],
        message: &QueueMessage,
    ) {
        if message.test_measure {
            debug!(target: &self.log_key, "test measure for {id}, not persisted");
            return;
        }
        if let Err(e) = self.artifacts.write_audio(
            id,
            shape,
            params,
            damping,
            samples,
            Local::now().naive_local(),
            message.output_dir.as_deref(),
        ) {
            error!(target: &self.log_key, "failed to persist audio for {id}: {e}");
        }
    }

    fn persist_tof(
        &self,
        id: SensorId,
        params: &TofParams,
        block: bool,
        damping: u16,
        counts: &[u32],
        message: &QueueMessage,
    ) {
        if message.test_measure {
            return;
        }
        let timestamp = Local::now().naive_local();
        let written = if block {
            self.artifacts
                .write_tof_block(id, params, damping, counts, timestamp)
        } else {
            self.artifacts.write_tof_impulse(id, counts, timestamp)
        };
        if let Err(e) = written {
            error!(target: &self.log_key, "failed to persist tof for {id}: {e}");
        }
    }

    fn push_recovery(&self, id: SensorId) {
        info!(target: &self.log_key, "scheduling recovery probe for {id}");
        self.queue.push_front(QueueMessage::recovery(
            id,
            Command::Probe {
                calibrate_after: true,
            },
        ));
    }

    /// Midnight: reset the queue and walk the whole roster with a
    /// probe+calibrate pair per sensor before periodic seeding resumes.
    fn midnight_sweep(&mut self) {
        info!(target: &self.log_key, "midnight probe and calibration sweep");
        self.queue.clear();
        for sensor in &self.sensors {
            self.queue.push_back(QueueMessage::periodic(
                sensor.id,
                Command::Probe {
                    calibrate_after: false,
                },
            ));
            self.queue.push_back(QueueMessage::periodic(
                sensor.id,
                Command::Calibrate {
                    measure_after: false,
                },
            ));
        }
    }

    /// Cycle turnover: reload configuration, bookkeep per-plan due times,
    /// seed the earliest-due plan and publish its deadline to the cadence
    /// task.
    fn reseed(&mut self, started: Instant) {
        self.reload_document();
        let elapsed = started.elapsed();
        let now = Instant::now();
        let finished_interval = match &self.current_plan {
            PlanChoice::Default => self.document.interval(),
            PlanChoice::Sub(name) => self
                .document
                .measurement_plans
                .iter()
                .find(|p| &p.plan_name == name)
                .map(|p| p.interval())
                .unwrap_or_else(|| self.document.interval()),
        };
        let due = now + next_cycle_delay(finished_interval, elapsed);
        match &self.current_plan {
            PlanChoice::Default => self.default_due = due,
            PlanChoice::Sub(name) => {
                self.sub_due.insert(name.clone(), due);
            }
        }
        self.sub_due
            .retain(|name, _| self.document.measurement_plans.iter().any(|p| &p.plan_name == name));
        for plan in &self.document.measurement_plans {
            self.sub_due
                .entry(plan.plan_name.clone())
                .or_insert(now + plan.interval());
        }
        // earliest-due plan runs next; plans never interleave within a cycle
        let mut next = (PlanChoice::Default, self.default_due);
        for (name, &d) in &self.sub_due {
            if d < next.1 {
                next = (PlanChoice::Sub(name.clone()), d);
            }
        }
        self.current_plan = next.0;
        self.seed_current();
        let _ = self.deadline.send(next.1);
        info!(
            target: &self.log_key,
            "cycle finished in {:?}, next cycle in {:?}",
            elapsed,
            next.1.saturating_duration_since(now)
        );
    }

    fn seed_current(&self) {
        let responsive = self.responsive_ids();
        let messages = match &self.current_plan {
            PlanChoice::Default => self.document.seed_messages(&responsive),
            PlanChoice::Sub(name) => self
                .document
                .measurement_plans
                .iter()
                .find(|p| &p.plan_name == name)
                .map(|p| p.seed_messages(&responsive))
                .unwrap_or_default(),
        };
        debug!(target: &self.log_key, "seeding {} periodic messages", messages.len());
        for message in messages {
            self.queue.push_back(message);
        }
    }

    fn responsive_ids(&self) -> Vec<SensorId> {
        self.sensors
            .iter()
            .filter(|s| s.responsive)
            .map(|s| s.id)
            .collect()
    }
}

/// The short sweep fired after a recovery calibration. Exercises the sensor
/// without producing an artifact.
fn test_measure(id: SensorId) -> QueueMessage {
    let mut message = QueueMessage::recovery(
        id,
        Command::MeasureBlock(SweepParams {
            start_freq_hz: 20_000,
            stop_freq_hz: 100_000,
            duration_us: 50_000,
            repetitions: 2,
            damping_level: None,
        }),
    );
    message.test_measure = true;
    message
}
