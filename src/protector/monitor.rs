//! Background monitor loop.
//!
//! [`MonitorContext`] bundles everything a probe or countermeasure needs and
//! is shared by `Arc` between the host-facing [`Protector`] and the single
//! background thread owned by [`MonitorLoop`].
//!
//! The loop's only cancellation primitive is the run flag inside
//! [`RunState`]. It is checked at the top of every iteration and the per-tick
//! sleep waits on a condvar, so `stop()` wakes the thread right away instead
//! of waiting out the interval.
//!
//! [`Protector`]: crate::protector::Protector

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::Instant;

use log::{debug, error, info};

use crate::protector::config::ProtectionConfig;
use crate::protector::countermeasures::CountermeasureExecutor;
use crate::protector::emulator_cache::EmulatorCache;
use crate::protector::environment::Environment;
use crate::protector::probes;
use crate::protector::process_control::ProcessControl;
use crate::protector::security_level::{SecurityLevel, SecurityLevelController};
use crate::protector::ThreatVerdict;
use crate::{Error, Result};

const MONITOR_THREAD_NAME: &str = "fguard-monitor";

// ============================================================================
// MONITOR CONTEXT
// ============================================================================

/// Shared state of one monitor instance.
pub struct MonitorContext {
    config: ProtectionConfig,
    env: Arc<dyn Environment>,
    level: SecurityLevelController,
    emulator_cache: EmulatorCache,
    countermeasures: CountermeasureExecutor,
}

impl MonitorContext {
    pub fn new(config: ProtectionConfig, env: Arc<dyn Environment>, control: Arc<dyn ProcessControl>) -> Self {
        let config = config.sanitized();
        MonitorContext {
            emulator_cache: EmulatorCache::new(config.emulator_cache_ttl),
            countermeasures: CountermeasureExecutor::new(control, config.noise_buffer_size),
            level: SecurityLevelController::default(),
            env,
            config,
        }
    }

    pub fn config(&self) -> &ProtectionConfig {
        &self.config
    }

    pub fn level(&self) -> &SecurityLevelController {
        &self.level
    }

    pub fn countermeasures(&self) -> &CountermeasureExecutor {
        &self.countermeasures
    }

    pub fn emulator_cache(&self) -> &EmulatorCache {
        &self.emulator_cache
    }

    pub fn is_being_traced(&self) -> bool {
        probes::is_being_traced(&*self.env)
    }

    pub fn has_hook_framework(&self) -> bool {
        probes::has_hook_framework(&*self.env)
    }

    /// Emulator verdict through the cache.
    pub fn is_running_in_emulator(&self) -> bool {
        self.emulator_cache
            .check(Instant::now(), || probes::detect_emulator(&*self.env))
    }

    pub fn is_virtualized(&self) -> bool {
        probes::detect_virtual_environment(&*self.env)
    }

    pub fn has_timing_anomaly(&self) -> bool {
        probes::detect_timing_anomaly(&*self.env, self.config.timing_workload, self.config.timing_threshold)
    }

    /// Level-gated analysis check. Level 1 consults the tracer and hook
    /// probes, level 2 adds the timing probe, level 3 the emulator probe.
    /// Probes outside the current gate are not run.
    pub fn is_being_analyzed(&self) -> bool {
        let level = self.level.current();

        if self.is_being_traced() || self.has_hook_framework() {
            return true;
        }
        if level >= SecurityLevel::Enhanced && self.has_timing_anomaly() {
            return true;
        }
        level >= SecurityLevel::Maximum && self.is_running_in_emulator()
    }

    /// Every probe once, ungated.
    pub fn full_verdict(&self) -> ThreatVerdict {
        ThreatVerdict {
            traced: self.is_being_traced(),
            hooked: self.has_hook_framework(),
            timing_anomaly: self.has_timing_anomaly(),
            emulator: self.is_running_in_emulator(),
            virtualized: self.is_virtualized(),
        }
    }

    /// Startup level: maximum if a hook framework or an emulator is present.
    pub fn derive_initial_level(&self) -> SecurityLevel {
        let emulator = self.is_running_in_emulator();
        let hooked = self.has_hook_framework();

        let level = if emulator || hooked {
            SecurityLevel::Maximum
        } else {
            SecurityLevel::Normal
        };

        self.level.set(level);
        info!("Native security level set to: {} (emulator: {}, hooks: {})", level, emulator, hooked);
        level
    }

    /// One loop iteration: probe, then respond. Cheap probes run every time,
    /// the emulator and virtualization probes every `heavy_probe_every`
    /// ticks, the timing probe every `timing_probe_every` ticks.
    pub fn tick(&self, iteration: u64) -> ThreatVerdict {
        let heavy = iteration % self.config.heavy_probe_every == 0;
        let timing = iteration % self.config.timing_probe_every == 0;

        let verdict = ThreatVerdict {
            traced: self.is_being_traced(),
            hooked: self.has_hook_framework(),
            emulator: heavy && self.is_running_in_emulator(),
            virtualized: heavy && self.is_virtualized(),
            timing_anomaly: timing && self.has_timing_anomaly(),
        };

        if verdict.is_threat() {
            self.respond(iteration, &verdict);
        }

        verdict
    }

    fn respond(&self, iteration: u64, verdict: &ThreatVerdict) {
        let mut level = self.level.current();

        if self.config.escalate_on_threat
            && level == SecurityLevel::Normal
            && self.level.escalate_from(SecurityLevel::Normal, SecurityLevel::Enhanced)
        {
            level = SecurityLevel::Enhanced;
            info!("Escalated security level to {} after threat", level);
        }

        debug!("Security threat detected ({:?}), applying protections at level {}", verdict, level);

        let policy = SecurityLevelController::policy(level);
        if policy.obfuscate_memory {
            self.countermeasures.obfuscate_memory();
        }
        if policy.block_attach {
            self.countermeasures.block_attach();
        }

        if iteration % self.config.spoof_every == 0 {
            self.countermeasures.spoof_identity();
        }
    }
}

// ============================================================================
// MONITOR LOOP
// ============================================================================

/// Run flag plus the handle of the thread it governs.
#[derive(Debug, Default)]
struct RunState {
    running: bool,
    /// Bumped on every start so a worker from an earlier run cannot resume
    generation: u64,
    worker: Option<JoinHandle<()>>,
}

#[derive(Debug, Default)]
struct Shared {
    state: Mutex<RunState>,
    wake: Condvar,
    ticks: AtomicU64,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, RunState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn should_run(state: &RunState, generation: u64) -> bool {
        state.running && state.generation == generation
    }
}

/// `Stopped → Running → Stopped`, with exactly one worker while running.
pub struct MonitorLoop {
    context: Arc<MonitorContext>,
    shared: Arc<Shared>,
}

impl MonitorLoop {
    pub fn new(context: Arc<MonitorContext>) -> Self {
        MonitorLoop {
            context,
            shared: Arc::new(Shared::default()),
        }
    }

    /// Spawn the worker. `Ok(false)` if it was already running.
    pub fn start(&self) -> Result<bool> {
        let mut state = self.shared.lock();
        if state.running {
            return Ok(false);
        }

        state.running = true;
        state.generation = state.generation.wrapping_add(1);
        let generation = state.generation;

        let context = Arc::clone(&self.context);
        let shared = Arc::clone(&self.shared);
        let spawned = thread::Builder::new()
            .name(MONITOR_THREAD_NAME.to_string())
            .spawn(move || run(context, shared, generation));

        match spawned {
            Ok(handle) => {
                // A worker left over from a self-stop exits on its own
                state.worker = Some(handle);
                info!("Security monitor thread started");
                Ok(true)
            }
            Err(e) => {
                state.running = false;
                Err(Error::Spawn(e))
            }
        }
    }

    /// Clear the run flag, wake the worker and wait for it to exit. When
    /// called from the worker itself the join is skipped.
    pub fn stop(&self) {
        let worker = {
            let mut state = self.shared.lock();
            if !state.running {
                return;
            }
            state.running = false;
            state.worker.take()
        };
        self.shared.wake.notify_all();

        if let Some(handle) = worker {
            if handle.thread().id() != thread::current().id() && handle.join().is_err() {
                error!("Security monitor thread terminated abnormally");
            }
        }
        info!("Security monitor stopped");
    }

    pub fn is_running(&self) -> bool {
        self.shared.lock().running
    }

    /// Completed ticks across all runs.
    pub fn ticks(&self) -> u64 {
        self.shared.ticks.load(Ordering::SeqCst)
    }
}

impl Drop for MonitorLoop {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run(context: Arc<MonitorContext>, shared: Arc<Shared>, generation: u64) {
    let mut iteration: u64 = 0;

    loop {
        if !Shared::should_run(&shared.lock(), generation) {
            break;
        }

        // A failing tick counts as "no threat" and the loop carries on
        if panic::catch_unwind(AssertUnwindSafe(|| context.tick(iteration))).is_err() {
            error!("Security monitor tick {} failed, treating as no threat", iteration);
        }
        shared.ticks.fetch_add(1, Ordering::SeqCst);

        let interval = SecurityLevelController::sleep_interval(context.level.current(), &context.config);
        let state = shared.lock();
        let (state, _) = shared
            .wake
            .wait_timeout_while(state, interval, |state| Shared::should_run(state, generation))
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        drop(state);

        iteration = iteration.wrapping_add(1);
    }

    debug!("Security monitor thread exiting");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protector::environment::MockEnvironment;
    use crate::protector::probes::{MAPS_PATH, STATUS_PATH};
    use crate::protector::process_control::{Directive, RecordingProcessControl};
    use std::io;
    use std::time::Duration;

    const TRACED_STATUS: &str = "Name:\tapp\nTracerPid:\t4321\n";

    fn fast_config() -> ProtectionConfig {
        ProtectionConfig {
            maximum_interval: Duration::from_millis(5),
            enhanced_interval: Duration::from_millis(5),
            normal_interval: Duration::from_millis(5),
            ..ProtectionConfig::default()
        }
    }

    fn context_with(
        config: ProtectionConfig,
        env: &Arc<MockEnvironment>,
        control: &Arc<RecordingProcessControl>,
    ) -> Arc<MonitorContext> {
        Arc::new(MonitorContext::new(config, env.clone(), control.clone()))
    }

    #[test]
    fn test_tick_staggers_expensive_probes() {
        let env = Arc::new(
            MockEnvironment::new()
                .with_property("ro.hardware", "goldfish")
                .with_path("/.dockerenv")
                .with_workload_time(Duration::from_millis(50)),
        );
        let control = Arc::new(RecordingProcessControl::new());
        let context = context_with(ProtectionConfig::default(), &env, &control);

        for iteration in 0..40u64 {
            let verdict = context.tick(iteration);
            assert_eq!(verdict.emulator, iteration % 10 == 0, "emulator at {}", iteration);
            assert_eq!(verdict.virtualized, iteration % 10 == 0, "virtualized at {}", iteration);
            assert_eq!(verdict.timing_anomaly, iteration % 5 == 0, "timing at {}", iteration);
            assert!(!verdict.traced && !verdict.hooked);
        }
    }

    #[test]
    fn test_clean_tick_takes_no_action() {
        let env = Arc::new(MockEnvironment::new().with_workload_time(Duration::ZERO));
        let control = Arc::new(RecordingProcessControl::new());
        let context = context_with(ProtectionConfig::default(), &env, &control);
        context.level().set(SecurityLevel::Maximum);

        for iteration in 0..25 {
            assert!(!context.tick(iteration).is_threat());
        }
        assert!(control.directives().is_empty());
        assert_eq!(context.countermeasures().stats().noise_buffers, 0);
    }

    #[test]
    fn test_threat_response_follows_level() {
        let env = Arc::new(MockEnvironment::new().with_file(STATUS_PATH, TRACED_STATUS));
        let control = Arc::new(RecordingProcessControl::new());
        let context = context_with(ProtectionConfig::default(), &env, &control);

        // Level 1: nothing beyond the periodic identity spoof
        context.level().set(SecurityLevel::Normal);
        assert!(context.tick(1).traced);
        assert!(control.directives().is_empty());

        // Level 2: attach blocking only
        context.level().set(SecurityLevel::Enhanced);
        context.tick(1);
        assert_eq!(control.count(|d| *d == Directive::NonDumpable), 1);
        assert_eq!(context.countermeasures().stats().noise_buffers, 0);

        // Level 3: noise plus attach blocking
        context.level().set(SecurityLevel::Maximum);
        context.tick(1);
        assert_eq!(control.count(|d| *d == Directive::NonDumpable), 2);
        assert_eq!(context.countermeasures().stats().noise_buffers, 1);
    }

    #[test]
    fn test_identity_spoofed_every_twentieth_threat_tick() {
        let env = Arc::new(MockEnvironment::new().with_file(STATUS_PATH, TRACED_STATUS));
        let control = Arc::new(RecordingProcessControl::new());
        let context = context_with(ProtectionConfig::default(), &env, &control);

        for iteration in 0..41 {
            context.tick(iteration);
        }

        let spoofs = control.count(|d| matches!(d, Directive::ProcessName(_)));
        assert_eq!(spoofs, 3, "iterations 0, 20 and 40");
    }

    #[test]
    fn test_no_spoof_without_threat() {
        let env = Arc::new(MockEnvironment::new().with_workload_time(Duration::ZERO));
        let control = Arc::new(RecordingProcessControl::new());
        let context = context_with(ProtectionConfig::default(), &env, &control);

        context.tick(20);
        assert!(control.directives().is_empty());
    }

    #[test]
    fn test_escalate_on_threat() {
        let env = Arc::new(MockEnvironment::new().with_file(MAPS_PATH, "7f00 r-xp /data/local/tmp/frida-agent.so\n"));
        let control = Arc::new(RecordingProcessControl::new());
        let config = ProtectionConfig {
            escalate_on_threat: true,
            ..ProtectionConfig::default()
        };
        let context = context_with(config, &env, &control);

        context.tick(1);
        assert_eq!(context.level().current(), SecurityLevel::Enhanced);
        assert_eq!(control.count(|d| *d == Directive::NonDumpable), 1);
    }

    #[test]
    fn test_level_gates_analysis_verdict() {
        let env = Arc::new(
            MockEnvironment::new()
                .with_property("ro.kernel.qemu", "emulator")
                .with_workload_time(Duration::from_millis(40)),
        );
        let control = Arc::new(RecordingProcessControl::new());
        let context = context_with(ProtectionConfig::default(), &env, &control);

        context.level().set(SecurityLevel::Normal);
        assert!(!context.is_being_analyzed());
        assert_eq!(context.emulator_cache().refreshes(), 0, "emulator probe is outside the level 1 gate");

        context.level().set(SecurityLevel::Enhanced);
        assert!(context.is_being_analyzed());

        context.level().set(SecurityLevel::Maximum);
        assert!(context.is_being_analyzed());
    }

    #[test]
    fn test_emulator_alone_needs_maximum_level() {
        let env = Arc::new(
            MockEnvironment::new()
                .with_path("/dev/socket/genyd")
                .with_workload_time(Duration::ZERO),
        );
        let control = Arc::new(RecordingProcessControl::new());
        let context = context_with(ProtectionConfig::default(), &env, &control);

        context.level().set(SecurityLevel::Enhanced);
        assert!(!context.is_being_analyzed());

        context.level().set(SecurityLevel::Maximum);
        assert!(context.is_being_analyzed());
    }

    #[test]
    fn test_initial_level_derivation() {
        let control = Arc::new(RecordingProcessControl::new());

        let hostile = Arc::new(
            MockEnvironment::new()
                .with_library("libxposed_art.so")
                .with_property("ro.hardware", "ranchu"),
        );
        let context = context_with(ProtectionConfig::default(), &hostile, &control);
        assert_eq!(context.derive_initial_level(), SecurityLevel::Maximum);
        assert_eq!(context.level().current().as_i32(), 3);

        let clean = Arc::new(MockEnvironment::new());
        let context = context_with(ProtectionConfig::default(), &clean, &control);
        context.level().set(SecurityLevel::Enhanced);
        assert_eq!(context.derive_initial_level(), SecurityLevel::Normal);
        assert_eq!(context.level().current().as_i32(), 1);
    }

    #[test]
    fn test_context_sanitizes_cadences() {
        let env = Arc::new(MockEnvironment::new());
        let control = Arc::new(RecordingProcessControl::new());
        let config = ProtectionConfig {
            heavy_probe_every: 0,
            timing_probe_every: 0,
            ..ProtectionConfig::default()
        };
        let context = context_with(config, &env, &control);

        assert_eq!(context.config().heavy_probe_every, 1);
        assert_eq!(context.config().timing_probe_every, 1);
        assert_eq!(context.config().spoof_every, 20);
    }

    #[test]
    fn test_emulator_verdict_outlives_removed_markers() {
        let env = Arc::new(
            MockEnvironment::new()
                .with_property("ro.product.model", "sdk_gphone64_x86_64")
                .with_path("/dev/qemu_pipe"),
        );
        let control = Arc::new(RecordingProcessControl::new());
        let context = context_with(ProtectionConfig::default(), &env, &control);

        assert!(context.is_running_in_emulator());

        // Within the cache window the earlier verdict stands
        env.clear_properties();
        env.remove_path("/dev/qemu_pipe");
        assert!(context.is_running_in_emulator());
        assert!(!probes::detect_emulator(&*env));
        assert_eq!(context.emulator_cache().refreshes(), 1);
    }

    #[test]
    fn test_tracer_detached_between_ticks() {
        let env = Arc::new(
            MockEnvironment::new()
                .with_file(STATUS_PATH, TRACED_STATUS)
                .with_workload_time(Duration::ZERO),
        );
        let control = Arc::new(RecordingProcessControl::new());
        let context = context_with(ProtectionConfig::default(), &env, &control);

        assert!(context.tick(1).traced);

        env.remove_file(STATUS_PATH);
        assert!(!context.tick(2).is_threat());
    }

    #[test]
    fn test_start_is_idempotent() {
        let env = Arc::new(MockEnvironment::new().with_workload_time(Duration::ZERO));
        let control = Arc::new(RecordingProcessControl::new());
        let monitor = MonitorLoop::new(context_with(fast_config(), &env, &control));

        assert!(!monitor.is_running());
        assert!(monitor.start().unwrap());
        assert!(!monitor.start().unwrap());
        assert!(monitor.is_running());

        monitor.stop();
        assert!(!monitor.is_running());
    }

    #[test]
    fn test_loop_ticks_until_stopped() {
        let env = Arc::new(MockEnvironment::new().with_workload_time(Duration::ZERO));
        let control = Arc::new(RecordingProcessControl::new());
        let monitor = MonitorLoop::new(context_with(fast_config(), &env, &control));

        monitor.start().unwrap();
        let deadline = Instant::now() + Duration::from_secs(5);
        while monitor.ticks() < 3 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        monitor.stop();

        assert!(monitor.ticks() >= 3);
    }

    #[test]
    fn test_no_probes_after_stop() {
        let env = Arc::new(MockEnvironment::new().with_workload_time(Duration::ZERO));
        let control = Arc::new(RecordingProcessControl::new());
        let monitor = MonitorLoop::new(context_with(fast_config(), &env, &control));

        monitor.start().unwrap();
        thread::sleep(Duration::from_millis(30));
        monitor.stop();

        let queries = env.queries();
        let ticks = monitor.ticks();
        thread::sleep(Duration::from_millis(50));

        assert_eq!(env.queries(), queries);
        assert_eq!(monitor.ticks(), ticks);
    }

    #[test]
    fn test_stop_wakes_sleeping_loop() {
        let env = Arc::new(MockEnvironment::new().with_workload_time(Duration::ZERO));
        let control = Arc::new(RecordingProcessControl::new());
        let config = ProtectionConfig {
            normal_interval: Duration::from_secs(30),
            ..ProtectionConfig::default()
        };
        let monitor = MonitorLoop::new(context_with(config, &env, &control));

        monitor.start().unwrap();
        thread::sleep(Duration::from_millis(20));

        let stopping = Instant::now();
        monitor.stop();
        assert!(stopping.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn test_restart_after_stop() {
        let env = Arc::new(MockEnvironment::new().with_workload_time(Duration::ZERO));
        let control = Arc::new(RecordingProcessControl::new());
        let monitor = MonitorLoop::new(context_with(fast_config(), &env, &control));

        assert!(monitor.start().unwrap());
        monitor.stop();
        assert!(monitor.start().unwrap());
        assert!(monitor.is_running());
        monitor.stop();
    }

    struct FailingEnvironment;

    impl Environment for FailingEnvironment {
        fn read_file(&self, _path: &str, _limit: usize) -> io::Result<Vec<u8>> {
            panic!("environment exploded");
        }

        fn read_property(&self, _name: &str) -> Option<String> {
            None
        }

        fn path_exists(&self, _path: &str) -> bool {
            false
        }

        fn load_library(&self, _name: &str) -> bool {
            false
        }
    }

    #[test]
    fn test_loop_survives_failing_tick() {
        let control: Arc<dyn ProcessControl> = Arc::new(RecordingProcessControl::new());
        let context = Arc::new(MonitorContext::new(fast_config(), Arc::new(FailingEnvironment), control));
        let monitor = MonitorLoop::new(context);

        monitor.start().unwrap();
        let deadline = Instant::now() + Duration::from_secs(5);
        while monitor.ticks() < 3 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }

        assert!(monitor.is_running());
        assert!(monitor.ticks() >= 3);
        monitor.stop();
    }
}
