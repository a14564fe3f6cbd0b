use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use super::loader::{LoadJob, SampleLoader};
use super::{
    db_to_gain, Cue, LoadState, SampleBuffer, SoundAsset, SoundGroup, SoundId, SoundOutput,
    SoundSource,
};
use crate::{MetrodroneError, Result};

pub type ReadyCallback = Box<dyn FnOnce() + Send>;

#[derive(Debug)]
struct SoundResource {
    group: SoundGroup,
    source: SoundSource,
    state: LoadState,
    gain_db: f32,
    /// Gain currently applied to the decoded asset; `None` until Ready.
    applied_gain_db: Option<f32>,
    buffer: Option<Arc<SampleBuffer>>,
    started: bool,
    /// Bumped on every (re)registration.
    load_token: u64,
}

#[derive(Default)]
struct PoolInner {
    resources: BTreeMap<SoundId, SoundResource>,
    next_token: u64,
    waiters: Vec<(SoundGroup, ReadyCallback)>,
    notified: HashSet<SoundGroup>,
}

impl PoolInner {
    fn group_ready(&self, group: SoundGroup) -> bool {
        let mut members = self.resources.values().filter(|r| r.group == group).peekable();
        members.peek().is_some() && members.all(|r| r.state == LoadState::Ready)
    }

    /// Removes and returns the callbacks of every group that just became
    /// fully ready.
    fn take_ready_callbacks(&mut self) -> Vec<ReadyCallback> {
        let groups: Vec<SoundGroup> = self
            .resources
            .values()
            .map(|r| r.group)
            .collect::<HashSet<_>>()
            .into_iter()
            .filter(|group| !self.notified.contains(group) && self.group_ready(*group))
            .collect();

        let mut callbacks = Vec::new();
        for group in groups {
            tracing::info!(%group, "sound group ready");
            self.notified.insert(group);
            let (ready, pending): (Vec<_>, Vec<_>) = std::mem::take(&mut self.waiters)
                .into_iter()
                .partition(|(waiting_for, _)| *waiting_for == group);
            self.waiters = pending;
            callbacks.extend(ready.into_iter().map(|(_, callback)| callback));
        }
        callbacks
    }
}

pub(crate) struct PoolShared {
    sample_rate: u32,
    inner: Mutex<PoolInner>,
    loaded: Condvar,
    output: Mutex<Box<dyn SoundOutput>>,
    loader: SampleLoader,
}

impl PoolShared {
    fn lock(&self) -> Result<MutexGuard<'_, PoolInner>> {
        self.inner
            .lock()
            .map_err(|_| MetrodroneError::Poisoned("sound pool"))
    }

    fn submit(&self, cue: Cue) {
        match self.output.lock() {
            Ok(mut output) => output.submit(cue),
            Err(_) => tracing::error!("sound output lock has been poisoned"),
        }
    }

    /// Records the outcome of a load and fires any group notifications it
    /// completes.
    pub(crate) fn finish_load(&self, id: &SoundId, token: u64, result: Result<SampleBuffer>) {
        let callbacks = {
            let Ok(mut inner) = self.lock() else {
                tracing::error!(%id, "dropping load result, pool lock poisoned");
                return;
            };
            let Some(resource) = inner.resources.get_mut(id) else {
                return;
            };
            if resource.load_token != token {
                tracing::debug!(%id, token, "discarding result of superseded load");
                return;
            }

            match result {
                Ok(buffer) => {
                    resource.buffer = Some(Arc::new(buffer));
                    resource.state = LoadState::Ready;
                    resource.applied_gain_db = Some(resource.gain_db);
                    tracing::debug!(%id, gain_db = resource.gain_db, "sound ready");
                }
                Err(err) => {
                    resource.state = LoadState::Failed;
                    tracing::warn!(%id, %err, "sound failed to load");
                }
            }

            inner.take_ready_callbacks()
        };

        self.loaded.notify_all();
        for callback in callbacks {
            callback();
        }
    }
}

/// Shared handle over the application's sound resources.
///
/// Clones refer to the same pool. Loading is asynchronous; playback requests
/// for a resource that is not Ready are silently skipped.
#[derive(Clone)]
pub struct SoundPool {
    shared: Arc<PoolShared>,
}

impl SoundPool {
    pub fn new(sample_rate: u32, output: impl SoundOutput + 'static) -> Self {
        let shared = Arc::new_cyclic(|weak| PoolShared {
            sample_rate,
            inner: Mutex::new(PoolInner::default()),
            loaded: Condvar::new(),
            output: Mutex::new(Box::new(output)),
            loader: SampleLoader::spawn(sample_rate, weak.clone()),
        });
        Self { shared }
    }

    pub fn sample_rate(&self) -> u32 {
        self.shared.sample_rate
    }

    /// Registers `id` and starts loading it in the background. Reloading an
    /// existing id keeps its gain but returns it to Loading.
    ///
    /// Loading a group one member at a time can report the group ready before
    /// its later members are registered; use [`SoundPool::load_all`] for
    /// groups.
    pub fn load(&self, id: SoundId, group: SoundGroup, source: SoundSource) -> LoadHandle {
        let token = self.register(id.clone(), group, source.clone());
        self.submit_job(id, token, source)
    }

    /// Registers every asset first, then queues them, so group readiness is
    /// only reported once the whole set has loaded.
    pub fn load_all(&self, assets: Vec<SoundAsset>) -> Vec<LoadHandle> {
        let tokens: Vec<u64> = assets
            .iter()
            .map(|asset| self.register(asset.id.clone(), asset.group, asset.source.clone()))
            .collect();
        assets
            .into_iter()
            .zip(tokens)
            .map(|(asset, token)| self.submit_job(asset.id, token, asset.source))
            .collect()
    }

    fn submit_job(&self, id: SoundId, token: u64, source: SoundSource) -> LoadHandle {
        let job = LoadJob {
            id: id.clone(),
            token,
            source,
        };
        if self.shared.loader.submit(job).is_err() {
            self.shared.finish_load(
                &id,
                token,
                Err(MetrodroneError::msg("sample loader is not running")),
            );
        }

        LoadHandle {
            id,
            pool: self.clone(),
        }
    }

    /// Registers `id` as Loading and returns the token its load result must
    /// carry. Tokens start at 1.
    pub(crate) fn register(&self, id: SoundId, group: SoundGroup, source: SoundSource) -> u64 {
        let Ok(mut inner) = self.shared.lock() else {
            tracing::error!(%id, "cannot register sound, pool lock poisoned");
            return 0;
        };
        let gain_db = inner.resources.get(&id).map_or(0.0, |r| r.gain_db);
        inner.next_token += 1;
        let load_token = inner.next_token;
        inner.notified.remove(&group);
        inner.resources.insert(
            id,
            SoundResource {
                group,
                source,
                state: LoadState::Loading,
                gain_db,
                applied_gain_db: None,
                buffer: None,
                started: false,
                load_token,
            },
        );
        load_token
    }

    pub(crate) fn finish_load(&self, id: &SoundId, token: u64, result: Result<SampleBuffer>) {
        self.shared.finish_load(id, token, result);
    }

    pub fn load_state(&self, id: &SoundId) -> Option<LoadState> {
        let inner = self.shared.lock().ok()?;
        inner.resources.get(id).map(|r| r.state)
    }

    pub fn is_ready(&self, id: &SoundId) -> bool {
        self.load_state(id) == Some(LoadState::Ready)
    }

    /// True once the group has members and all of them are Ready.
    pub fn is_group_ready(&self, group: SoundGroup) -> bool {
        self.shared
            .lock()
            .map(|inner| inner.group_ready(group))
            .unwrap_or(false)
    }

    pub fn ids_in_group(&self, group: SoundGroup) -> Vec<SoundId> {
        self.shared
            .lock()
            .map(|inner| {
                inner
                    .resources
                    .iter()
                    .filter(|(_, r)| r.group == group)
                    .map(|(id, _)| id.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Runs `callback` once every member of `group` is Ready. Fires right away
    /// if that already happened; never fires if a member failed.
    pub fn on_group_ready(&self, group: SoundGroup, callback: impl FnOnce() + Send + 'static) {
        let callback: ReadyCallback = Box::new(callback);
        let run_now = match self.shared.lock() {
            Ok(mut inner) => {
                if inner.notified.contains(&group) && inner.group_ready(group) {
                    Some(callback)
                } else {
                    inner.waiters.push((group, callback));
                    None
                }
            }
            Err(err) => {
                tracing::error!(%err, %group, "cannot register readiness callback");
                None
            }
        };
        if let Some(callback) = run_now {
            callback();
        }
    }

    /// Blocks until `group` is ready, a member fails, or `timeout` elapses.
    pub fn wait_for_group(&self, group: SoundGroup, timeout: Duration) -> bool {
        self.wait_until(timeout, |inner| {
            let settled = inner
                .resources
                .values()
                .filter(|r| r.group == group)
                .all(|r| r.state != LoadState::Loading);
            settled.then(|| inner.group_ready(group))
        })
        .unwrap_or(false)
    }

    fn wait_until<T>(
        &self,
        timeout: Duration,
        mut check: impl FnMut(&PoolInner) -> Option<T>,
    ) -> Option<T> {
        let deadline = Instant::now() + timeout;
        let mut inner = self.shared.lock().ok()?;
        loop {
            if let Some(value) = check(&inner) {
                return Some(value);
            }
            let remaining = deadline.checked_duration_since(Instant::now())?;
            if remaining.is_zero() {
                return None;
            }
            inner = self
                .shared
                .loaded
                .wait_timeout(inner, remaining)
                .map(|(guard, _)| guard)
                .ok()?;
        }
    }

    /// Sets the gain of a single resource. Applied immediately when Ready,
    /// otherwise remembered and applied once loading completes.
    pub fn set_gain(&self, id: &SoundId, decibels: f32) -> Result<()> {
        let sounding = {
            let mut inner = self.shared.lock()?;
            let resource = inner
                .resources
                .get_mut(id)
                .ok_or_else(|| MetrodroneError::UnknownSound(id.to_string()))?;
            resource.gain_db = decibels;
            if resource.state == LoadState::Ready {
                resource.applied_gain_db = Some(decibels);
            }
            resource.started
        };

        if sounding {
            self.shared.submit(Cue::Gain {
                id: id.clone(),
                gain: db_to_gain(decibels),
            });
        }
        Ok(())
    }

    /// Applies `decibels` uniformly to every member of `group`.
    pub fn set_volume(&self, group: SoundGroup, decibels: f32) -> Result<()> {
        for id in self.ids_in_group(group) {
            self.set_gain(&id, decibels)?;
        }
        tracing::debug!(%group, decibels, "group volume set");
        Ok(())
    }

    /// Configured gain of `id`, whether or not it has been applied yet.
    pub fn gain(&self, id: &SoundId) -> Option<f32> {
        let inner = self.shared.lock().ok()?;
        inner.resources.get(id).map(|r| r.gain_db)
    }

    /// Gain in effect on the loaded asset; `None` while not Ready.
    pub fn effective_gain(&self, id: &SoundId) -> Option<f32> {
        let inner = self.shared.lock().ok()?;
        inner.resources.get(id).and_then(|r| r.applied_gain_db)
    }

    /// Plays `id` once, at `at` on the clock timeline when given. Returns
    /// whether anything was played; not-Ready resources are skipped.
    pub fn trigger(&self, id: &SoundId, at: Option<Duration>) -> bool {
        self.play(id, at, false)
    }

    pub(crate) fn trigger_and_loop(&self, id: &SoundId) -> bool {
        self.play(id, None, true)
    }

    pub(crate) fn stop(&self, id: &SoundId) {
        let was_started = match self.shared.lock() {
            Ok(mut inner) => inner
                .resources
                .get_mut(id)
                .map(|r| std::mem::replace(&mut r.started, false))
                .unwrap_or(false),
            Err(_) => return,
        };
        if was_started {
            self.shared.submit(Cue::Stop { id: id.clone() });
        }
    }

    /// Whether a looping playback of `id` is currently started.
    pub fn is_started(&self, id: &SoundId) -> bool {
        self.shared
            .lock()
            .ok()
            .and_then(|inner| inner.resources.get(id).map(|r| r.started))
            .unwrap_or(false)
    }

    fn play(&self, id: &SoundId, at: Option<Duration>, looping: bool) -> bool {
        let cue = {
            let Ok(mut inner) = self.shared.lock() else {
                return false;
            };
            let Some(resource) = inner.resources.get_mut(id) else {
                tracing::trace!(%id, "trigger skipped, unknown sound");
                return false;
            };
            let (Some(buffer), Some(gain_db)) = (&resource.buffer, resource.applied_gain_db)
            else {
                tracing::trace!(%id, state = ?resource.state, "trigger skipped, not ready");
                return false;
            };
            if resource.state != LoadState::Ready {
                return false;
            }
            let cue = Cue::Play {
                id: id.clone(),
                buffer: Arc::clone(buffer),
                gain: db_to_gain(gain_db),
                at,
                looping,
            };
            if looping {
                resource.started = true;
            }
            cue
        };

        self.shared.submit(cue);
        true
    }

    /// Source the resource was registered with.
    pub fn source(&self, id: &SoundId) -> Option<SoundSource> {
        let inner = self.shared.lock().ok()?;
        inner.resources.get(id).map(|r| r.source.clone())
    }
}

impl std::fmt::Debug for SoundPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let resources = self
            .shared
            .inner
            .lock()
            .map(|inner| inner.resources.len())
            .unwrap_or(0);
        f.debug_struct("SoundPool")
            .field("sample_rate", &self.shared.sample_rate)
            .field("resources", &resources)
            .finish()
    }
}

/// Readiness future for a single resource.
#[derive(Clone)]
pub struct LoadHandle {
    id: SoundId,
    pool: SoundPool,
}

impl LoadHandle {
    pub fn id(&self) -> &SoundId {
        &self.id
    }

    pub fn state(&self) -> LoadState {
        self.pool.load_state(&self.id).unwrap_or(LoadState::Failed)
    }

    /// Blocks until the resource leaves Loading or `timeout` elapses, and
    /// returns the state it ended in.
    pub fn wait(&self, timeout: Duration) -> LoadState {
        self.pool
            .wait_until(timeout, |inner| {
                let state = inner.resources.get(&self.id).map_or(LoadState::Failed, |r| r.state);
                (state != LoadState::Loading).then_some(state)
            })
            .unwrap_or(LoadState::Loading)
    }
}

impl std::fmt::Debug for LoadHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoadHandle").field("id", &self.id).finish()
    }
}
