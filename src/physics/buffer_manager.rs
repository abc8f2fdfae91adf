use std::ops::Deref;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;

use bytemuck::Pod;
use log::{debug, info, warn};
use wgpu::{Buffer, BufferUsages};

use crate::body::{Double4, Float4};
use crate::error::{DeviceErrorKind, Result, SimError};
use crate::gpu::capabilities::DeviceLimits;
use crate::gpu::DeviceBinding;

/// Depth of the velocity/acceleration history rings.
pub const HISTORY_DEPTH: usize = 16;

/// Ring slot that holds step `step`.
pub fn history_slot(step: u64) -> usize {
    (step & (HISTORY_DEPTH as u64 - 1)) as usize
}

/// Counts live device buffers across every allocator that shares it.
#[derive(Clone, Debug, Default)]
pub struct AllocationTracker {
    live: Arc<AtomicUsize>,
}

impl AllocationTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn outstanding(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    pub fn register(&self) -> AllocationGuard {
        self.live.fetch_add(1, Ordering::SeqCst);
        AllocationGuard {
            live: Arc::clone(&self.live),
        }
    }
}

/// Decrements its tracker when the owning buffer is released.
#[derive(Debug)]
pub struct AllocationGuard {
    live: Arc<AtomicUsize>,
}

impl Drop for AllocationGuard {
    fn drop(&mut self) {
        self.live.fetch_sub(1, Ordering::SeqCst);
    }
}

/// How a buffer is declared in the kernel source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindingKind {
    Storage { read_only: bool },
    Uniform,
}

/// Every device-resident array of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BufferRole {
    CurrPos,
    CurrVel,
    NewPos,
    NewVel,
    Acc,
    GravPos,
    PosLast,
    VelLast,
    VelHistory,
    AccHistory,
    Display,
}

impl BufferRole {
    /// Allocation order of a batch.
    pub const ALL: [BufferRole; 11] = [
        BufferRole::CurrPos,
        BufferRole::CurrVel,
        BufferRole::NewPos,
        BufferRole::NewVel,
        BufferRole::Acc,
        BufferRole::GravPos,
        BufferRole::PosLast,
        BufferRole::VelLast,
        BufferRole::VelHistory,
        BufferRole::AccHistory,
        BufferRole::Display,
    ];

    pub fn label(&self) -> &'static str {
        match self {
            BufferRole::CurrPos => "currPos",
            BufferRole::CurrVel => "currVel",
            BufferRole::NewPos => "newPos",
            BufferRole::NewVel => "newVel",
            BufferRole::Acc => "acc",
            BufferRole::GravPos => "gravPos",
            BufferRole::PosLast => "posLast",
            BufferRole::VelLast => "velLast",
            BufferRole::VelHistory => "velHistory",
            BufferRole::AccHistory => "accHistory",
            BufferRole::Display => "dispPos",
        }
    }

    /// `@group(0)` slot of the matching global in the kernel source.
    pub fn binding(&self) -> u32 {
        match self {
            BufferRole::GravPos => 0,
            BufferRole::CurrPos => 1,
            BufferRole::CurrVel => 2,
            BufferRole::Acc => 3,
            BufferRole::NewPos => 4,
            BufferRole::NewVel => 5,
            BufferRole::PosLast => 6,
            BufferRole::VelLast => 7,
            BufferRole::VelHistory => 8,
            BufferRole::AccHistory => 9,
            BufferRole::Display => 10,
        }
    }

    pub fn binding_kind(&self) -> BindingKind {
        match self {
            BufferRole::GravPos => BindingKind::Uniform,
            BufferRole::CurrPos | BufferRole::CurrVel => BindingKind::Storage { read_only: true },
            _ => BindingKind::Storage { read_only: false },
        }
    }

    pub fn element_size(&self) -> usize {
        match self {
            BufferRole::Display => std::mem::size_of::<Float4>(),
            _ => std::mem::size_of::<Double4>(),
        }
    }

    pub fn usage(&self) -> BufferUsages {
        match self {
            BufferRole::GravPos => BufferUsages::UNIFORM | BufferUsages::COPY_DST | BufferUsages::COPY_SRC,
            BufferRole::Display => BufferUsages::STORAGE | BufferUsages::VERTEX | BufferUsages::COPY_SRC,
            _ => BufferUsages::STORAGE | BufferUsages::COPY_DST | BufferUsages::COPY_SRC,
        }
    }

    /// Element count for this role.
    pub fn len(&self, sizing: &BufferSizing) -> usize {
        match self {
            BufferRole::GravPos => sizing.num_grav,
            BufferRole::VelHistory | BufferRole::AccHistory => HISTORY_DEPTH * sizing.num_particles,
            _ => sizing.num_particles,
        }
    }
}

/// Final particle/gravitating counts after rounding and clamping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferSizing {
    pub num_particles: usize,
    pub num_grav: usize,
    pub group_size: u32,
}

impl BufferSizing {
    /// Round N down to a multiple of `group_size` and clamp G to what the
    /// constant buffer holds.
    pub fn negotiate(
        requested_particles: usize,
        requested_grav: usize,
        group_size: u32,
        limits: &DeviceLimits,
    ) -> Result<Self> {
        if group_size == 0 {
            return Err(SimError::InvalidConfig("work-group size must be positive".into()));
        }
        let group = group_size as usize;
        let num_particles = requested_particles / group * group;
        if num_particles == 0 {
            return Err(SimError::InvalidConfig(format!(
                "{} particles is fewer than one work group of {}",
                requested_particles, group_size
            )));
        }
        if num_particles != requested_particles {
            info!("particle count rounded down from {} to {}", requested_particles, num_particles);
        }

        let num_grav = requested_grav.min(num_particles).min(limits.max_gravitating());
        if num_grav == 0 {
            return Err(SimError::InvalidConfig("no gravitating bodies".into()));
        }
        if num_grav != requested_grav {
            warn!("gravitating count clamped from {} to {}", requested_grav, num_grav);
        }

        Ok(Self {
            num_particles,
            num_grav,
            group_size,
        })
    }
}

/// Source of buffers for a batch. The device binding allocates on the GPU;
/// the host model allocates plain memory.
pub trait BufferAllocator {
    type Buffer;

    fn allocate(&self, role: BufferRole, len: usize) -> Result<Self::Buffer>;
}

/// A device buffer that reports its release to the allocation tracker.
pub struct TrackedBuffer {
    buffer: Buffer,
    len: usize,
    _guard: AllocationGuard,
}

impl TrackedBuffer {
    /// Create a device buffer inside an error scope and register it with the
    /// binding's tracker.
    pub(crate) fn create(
        binding: &DeviceBinding,
        label: &str,
        len: usize,
        size: u64,
        usage: BufferUsages,
    ) -> Result<Self> {
        if size > binding.limits().max_buffer_size {
            return Err(SimError::Allocation {
                buffer: label.to_string(),
                kind: DeviceErrorKind::OutOfMemory,
                detail: format!("{} bytes exceeds the device maximum of {}", size, binding.limits().max_buffer_size),
            });
        }

        let (buffer, error) = binding.capture(|| {
            binding.device().create_buffer(&wgpu::BufferDescriptor {
                label: Some(label),
                size,
                usage,
                mapped_at_creation: false,
            })
        });
        if let Some(err) = error {
            return Err(SimError::allocation(label, &err));
        }

        Ok(Self {
            buffer,
            len,
            _guard: binding.tracker().register(),
        })
    }

    pub fn buffer(&self) -> &Buffer {
        &self.buffer
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl Drop for TrackedBuffer {
    fn drop(&mut self) {
        self.buffer.destroy();
    }
}

impl BufferAllocator for DeviceBinding {
    type Buffer = TrackedBuffer;

    fn allocate(&self, role: BufferRole, len: usize) -> Result<TrackedBuffer> {
        let size = (len * role.element_size()) as u64;
        TrackedBuffer::create(self, role.label(), len, size, role.usage())
    }
}

/// Who may touch the display buffer right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisplayOwner {
    Graphics,
    Compute,
}

const DISPLAY_IDLE: u8 = 0;
const DISPLAY_COMPUTE: u8 = 1;
const DISPLAY_RENDERING: u8 = 2;

/// The buffer shared with the renderer. It is owned by graphics except
/// between [`DisplayBuffer::acquire`] and the drop of the returned guard.
pub struct DisplayBuffer<B> {
    buffer: B,
    state: AtomicU8,
}

impl<B> DisplayBuffer<B> {
    pub fn new(buffer: B) -> Self {
        Self {
            buffer,
            state: AtomicU8::new(DISPLAY_IDLE),
        }
    }

    pub fn owner(&self) -> DisplayOwner {
        match self.state.load(Ordering::SeqCst) {
            DISPLAY_COMPUTE => DisplayOwner::Compute,
            _ => DisplayOwner::Graphics,
        }
    }

    /// Take the buffer from graphics for a write.
    pub fn acquire(&self) -> Result<DisplayGuard<'_, B>> {
        self.state
            .compare_exchange(DISPLAY_IDLE, DISPLAY_COMPUTE, Ordering::SeqCst, Ordering::SeqCst)
            .map_err(|state| SimError::DisplayBusy(owner_name(state)))?;
        Ok(DisplayGuard { display: self })
    }

    /// Renderer-side access; fails while compute holds the buffer.
    pub fn begin_render(&self) -> Result<RenderGuard<'_, B>> {
        self.state
            .compare_exchange(DISPLAY_IDLE, DISPLAY_RENDERING, Ordering::SeqCst, Ordering::SeqCst)
            .map_err(|state| SimError::DisplayBusy(owner_name(state)))?;
        Ok(RenderGuard { display: self })
    }

    /// Host-side write bracket: acquire, run `write`, release.
    pub fn write_acquired<R>(&mut self, write: impl FnOnce(&mut B) -> R) -> Result<R> {
        self.state
            .compare_exchange(DISPLAY_IDLE, DISPLAY_COMPUTE, Ordering::SeqCst, Ordering::SeqCst)
            .map_err(|state| SimError::DisplayBusy(owner_name(state)))?;
        let result = write(&mut self.buffer);
        self.state.store(DISPLAY_IDLE, Ordering::SeqCst);
        Ok(result)
    }

    /// Unchecked access for bind-group creation. Never used for writes.
    pub(crate) fn raw(&self) -> &B {
        &self.buffer
    }

    pub(crate) fn raw_mut(&mut self) -> &mut B {
        &mut self.buffer
    }
}

fn owner_name(state: u8) -> &'static str {
    match state {
        DISPLAY_COMPUTE => "compute",
        _ => "graphics",
    }
}

/// Compute-side hold on the display buffer. Dropping it releases the buffer
/// back to graphics.
pub struct DisplayGuard<'a, B> {
    display: &'a DisplayBuffer<B>,
}

impl<B> Deref for DisplayGuard<'_, B> {
    type Target = B;

    fn deref(&self) -> &B {
        &self.display.buffer
    }
}

impl<B> Drop for DisplayGuard<'_, B> {
    fn drop(&mut self) {
        self.display.state.store(DISPLAY_IDLE, Ordering::SeqCst);
    }
}

pub struct RenderGuard<'a, B> {
    display: &'a DisplayBuffer<B>,
}

impl<B> Deref for RenderGuard<'_, B> {
    type Target = B;

    fn deref(&self) -> &B {
        &self.display.buffer
    }
}

impl<B> Drop for RenderGuard<'_, B> {
    fn drop(&mut self) {
        self.display.state.store(DISPLAY_IDLE, Ordering::SeqCst);
    }
}

/// All state vectors, history rings and the display buffer of one session.
pub struct BufferSet<B> {
    sizing: BufferSizing,
    curr_pos: B,
    curr_vel: B,
    new_pos: B,
    new_vel: B,
    acc: B,
    grav_pos: B,
    pos_last: B,
    vel_last: B,
    vel_history: B,
    acc_history: B,
    display: DisplayBuffer<B>,
}

impl<B> BufferSet<B> {
    pub fn sizing(&self) -> &BufferSizing {
        &self.sizing
    }

    pub fn num_particles(&self) -> usize {
        self.sizing.num_particles
    }

    pub fn num_grav(&self) -> usize {
        self.sizing.num_grav
    }

    pub fn display(&self) -> &DisplayBuffer<B> {
        &self.display
    }

    pub fn display_mut(&mut self) -> &mut DisplayBuffer<B> {
        &mut self.display
    }

    pub fn get(&self, role: BufferRole) -> &B {
        match role {
            BufferRole::CurrPos => &self.curr_pos,
            BufferRole::CurrVel => &self.curr_vel,
            BufferRole::NewPos => &self.new_pos,
            BufferRole::NewVel => &self.new_vel,
            BufferRole::Acc => &self.acc,
            BufferRole::GravPos => &self.grav_pos,
            BufferRole::PosLast => &self.pos_last,
            BufferRole::VelLast => &self.vel_last,
            BufferRole::VelHistory => &self.vel_history,
            BufferRole::AccHistory => &self.acc_history,
            BufferRole::Display => self.display.raw(),
        }
    }

    pub fn get_mut(&mut self, role: BufferRole) -> &mut B {
        match role {
            BufferRole::CurrPos => &mut self.curr_pos,
            BufferRole::CurrVel => &mut self.curr_vel,
            BufferRole::NewPos => &mut self.new_pos,
            BufferRole::NewVel => &mut self.new_vel,
            BufferRole::Acc => &mut self.acc,
            BufferRole::GravPos => &mut self.grav_pos,
            BufferRole::PosLast => &mut self.pos_last,
            BufferRole::VelLast => &mut self.vel_last,
            BufferRole::VelHistory => &mut self.vel_history,
            BufferRole::AccHistory => &mut self.acc_history,
            BufferRole::Display => self.display.raw_mut(),
        }
    }
}

/// Allocates a whole [`BufferSet`] or nothing.
pub struct BufferManager<'a, A: BufferAllocator> {
    allocator: &'a A,
}

impl<'a, A: BufferAllocator> BufferManager<'a, A> {
    pub fn new(allocator: &'a A) -> Self {
        Self { allocator }
    }

    /// Allocate every buffer for `sizing`. On failure the buffers created so
    /// far in this batch are dropped before the error is returned.
    pub fn allocate(&self, sizing: BufferSizing) -> Result<BufferSet<A::Buffer>> {
        let set = BufferSet {
            sizing,
            curr_pos: self.create(BufferRole::CurrPos, &sizing)?,
            curr_vel: self.create(BufferRole::CurrVel, &sizing)?,
            new_pos: self.create(BufferRole::NewPos, &sizing)?,
            new_vel: self.create(BufferRole::NewVel, &sizing)?,
            acc: self.create(BufferRole::Acc, &sizing)?,
            grav_pos: self.create(BufferRole::GravPos, &sizing)?,
            pos_last: self.create(BufferRole::PosLast, &sizing)?,
            vel_last: self.create(BufferRole::VelLast, &sizing)?,
            vel_history: self.create(BufferRole::VelHistory, &sizing)?,
            acc_history: self.create(BufferRole::AccHistory, &sizing)?,
            display: DisplayBuffer::new(self.create(BufferRole::Display, &sizing)?),
        };

        info!(
            "allocated {} buffers for {} particles, {} gravitating",
            BufferRole::ALL.len(),
            sizing.num_particles,
            sizing.num_grav
        );
        Ok(set)
    }

    fn create(&self, role: BufferRole, sizing: &BufferSizing) -> Result<A::Buffer> {
        let len = role.len(sizing);
        debug!("allocating {} ({} elements)", role.label(), len);
        self.allocator.allocate(role, len).map_err(|e| {
            warn!("allocation of {} failed, releasing batch", role.label());
            e
        })
    }
}

fn readback_error(err: &wgpu::Error) -> SimError {
    SimError::Readback(format!("{}: {}", DeviceErrorKind::from(err), err))
}

/// Blocking read of `count` elements through a staging buffer.
pub fn read_buffer<T: Pod>(binding: &DeviceBinding, buffer: &Buffer, count: usize) -> Result<Vec<T>> {
    binding.loss().check("read back")?;
    let byte_size = (count * std::mem::size_of::<T>()) as u64;
    let (staging, scope_error) = binding.capture(|| {
        let staging = binding.device().create_buffer(&wgpu::BufferDescriptor {
            label: Some("Staging Buffer"),
            size: byte_size,
            usage: BufferUsages::MAP_READ | BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });

        let mut encoder = binding.device().create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("Readback Encoder"),
        });
        encoder.copy_buffer_to_buffer(buffer, 0, &staging, 0, byte_size);
        binding.queue().submit(Some(encoder.finish()));
        staging
    });
    if let Some(err) = scope_error {
        return Err(readback_error(&err));
    }

    let slice = staging.slice(..);
    let (tx, rx) = futures::channel::oneshot::channel();
    slice.map_async(wgpu::MapMode::Read, move |result| {
        let _ = tx.send(result);
    });
    binding.wait_idle();

    pollster::block_on(rx)
        .map_err(|e| SimError::Readback(format!("channel closed: {}", e)))?
        .map_err(|e| SimError::Readback(format!("buffer mapping failed: {}", e)))?;

    let data = slice.get_mapped_range();
    let values: Vec<T> = bytemuck::cast_slice(&data).to_vec();
    drop(data);
    staging.unmap();

    Ok(values)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limits(constant_buffer_size: u32) -> DeviceLimits {
        DeviceLimits {
            max_work_group_size: 256,
            max_work_item_sizes: [256, 256, 64],
            local_memory_size: 16384,
            constant_buffer_size,
            max_buffer_size: 1 << 30,
        }
    }

    #[test]
    fn test_history_slot_is_periodic() {
        for step in 0..64u64 {
            assert_eq!(history_slot(step), (step % 16) as usize);
            assert_eq!(history_slot(step), history_slot(step + 16));
        }
        assert_eq!(history_slot(u64::MAX), 15);
    }

    #[test]
    fn test_rejected_staging_copy_is_a_readback_error() {
        let err = wgpu::Error::OutOfMemory {
            source: Box::new(std::io::Error::new(std::io::ErrorKind::Other, "staging buffer")),
        };
        match readback_error(&err) {
            SimError::Readback(detail) => assert!(detail.starts_with("OUT_OF_MEMORY")),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_sizing_rounds_particles_down() {
        let sizing = BufferSizing::negotiate(1000, 16, 64, &limits(65536)).unwrap();
        assert_eq!(sizing.num_particles, 960);
        assert_eq!(sizing.num_grav, 16);
    }

    #[test]
    fn test_sizing_clamps_gravitating_to_constant_memory() {
        let sizing = BufferSizing::negotiate(8192, 5000, 64, &limits(65536)).unwrap();
        assert_eq!(sizing.num_grav, 65536 / 32);
    }

    #[test]
    fn test_sizing_rejects_too_few_particles() {
        assert!(matches!(
            BufferSizing::negotiate(10, 1, 64, &limits(65536)),
            Err(SimError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_role_lengths_and_bindings() {
        let sizing = BufferSizing {
            num_particles: 128,
            num_grav: 8,
            group_size: 64,
        };
        assert_eq!(BufferRole::CurrPos.len(&sizing), 128);
        assert_eq!(BufferRole::GravPos.len(&sizing), 8);
        assert_eq!(BufferRole::VelHistory.len(&sizing), 16 * 128);
        assert_eq!(BufferRole::Display.element_size(), 16);

        let mut bindings: Vec<u32> = BufferRole::ALL.iter().map(|r| r.binding()).collect();
        bindings.sort_unstable();
        bindings.dedup();
        assert_eq!(bindings.len(), BufferRole::ALL.len());
    }

    #[test]
    fn test_display_ownership_is_exclusive() {
        let display = DisplayBuffer::new(7u32);
        assert_eq!(display.owner(), DisplayOwner::Graphics);
        {
            let guard = display.acquire().unwrap();
            assert_eq!(*guard, 7);
            assert_eq!(display.owner(), DisplayOwner::Compute);
            assert!(matches!(display.begin_render(), Err(SimError::DisplayBusy("compute"))));
            assert!(display.acquire().is_err());
        }
        assert_eq!(display.owner(), DisplayOwner::Graphics);

        let render = display.begin_render().unwrap();
        assert!(matches!(display.acquire(), Err(SimError::DisplayBusy("graphics"))));
        drop(render);
        assert!(display.acquire().is_ok());
    }

    #[test]
    fn test_tracker_counts_guards() {
        let tracker = AllocationTracker::new();
        let a = tracker.register();
        let b = tracker.clone().register();
        assert_eq!(tracker.outstanding(), 2);
        drop(a);
        drop(b);
        assert_eq!(tracker.outstanding(), 0);
    }
}
