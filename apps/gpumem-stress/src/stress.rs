//! Multi-threaded allocate/map/free cycles against a mock device.

use anyhow::{bail, ensure, Context};
use gpumem::mock::{MockBackend, MockResource};
use gpumem::{
    DeferredFreeQueue, EmptyChunkPolicy, GpuMemoryHandle, GpuMemoryManager,
    GpuMemoryManagerStats, ManagerConfig, MemoryError, MemoryPropertyFlags as Flags, OomPolicy,
};
use rand::prelude::*;
use rayon::prelude::*;

type Handle = GpuMemoryHandle<MockBackend>;

const ALIGNMENTS: [u64; 4] = [1, 16, 256, 4096];

/// One in this many allocations is dedicated.
const DEDICATED_RATE: u32 = 64;

/// Simulated device layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Device {
    Discrete,
    Rebar,
    Integrated,
}

impl Device {
    fn backend(self) -> MockBackend {
        match self {
            Self::Discrete => MockBackend::discrete(),
            Self::Rebar => MockBackend::rebar(),
            Self::Integrated => MockBackend::integrated(),
        }
    }
}

/// Stress run parameters.
#[derive(Debug, Clone)]
pub struct StressConfig {
    pub device: Device,
    pub frames: u64,
    pub allocs_per_frame: usize,
    pub max_size: u64,
    pub frames_in_flight: usize,
    pub seed: u64,
    pub release_empty: bool,
}

impl Default for StressConfig {
    fn default() -> Self {
        Self {
            device: Device::Discrete,
            frames: 120,
            allocs_per_frame: 512,
            max_size: 4 * 1024 * 1024,
            frames_in_flight: 2,
            seed: 42,
            release_empty: false,
        }
    }
}

impl StressConfig {
    /// Parse stress parameters from command line arguments.
    pub fn from_args() -> anyhow::Result<Self> {
        Self::parse(std::env::args().skip(1))
    }

    fn parse(args: impl IntoIterator<Item = String>) -> anyhow::Result<Self> {
        let mut config = Self::default();
        let mut args = args.into_iter();

        while let Some(arg) = args.next() {
            let mut value = || args.next().with_context(|| format!("{arg} needs a value"));
            match arg.as_str() {
                "--device" => {
                    config.device = match value()?.as_str() {
                        "discrete" => Device::Discrete,
                        "rebar" => Device::Rebar,
                        "integrated" => Device::Integrated,
                        other => bail!("Unknown device '{other}'"),
                    };
                }
                "--frames" => config.frames = value()?.parse().context("--frames")?,
                "--allocs-per-frame" => {
                    config.allocs_per_frame = value()?.parse().context("--allocs-per-frame")?;
                }
                "--max-size" => config.max_size = value()?.parse().context("--max-size")?,
                "--frames-in-flight" => {
                    config.frames_in_flight = value()?.parse().context("--frames-in-flight")?;
                }
                "--seed" => config.seed = value()?.parse().context("--seed")?,
                "--release-empty" => config.release_empty = true,
                other => bail!("Unknown argument '{other}', see --help"),
            }
        }

        ensure!(config.max_size > 0, "--max-size must be positive");
        Ok(config)
    }
}

/// What a run did.
#[derive(Debug, Clone, Default)]
pub struct StressReport {
    pub allocations: usize,
    pub frees: usize,
    pub peak_live: usize,
    pub peak_stats: GpuMemoryManagerStats,
}

/// A live allocation and the byte written to its ends.
struct Live {
    handle: Handle,
    tag: Option<u8>,
}

/// Run the stress test to completion.
pub fn run(config: &StressConfig) -> anyhow::Result<StressReport> {
    let policy = if config.release_empty {
        EmptyChunkPolicy::Release
    } else {
        EmptyChunkPolicy::Retain
    };
    let mut manager = GpuMemoryManager::new(
        config.device.backend(),
        ManagerConfig::default()
            .with_oom_policy(OomPolicy::ReturnError)
            .with_empty_chunk_policy(policy),
    )?;

    let targets = target_memory_types(&manager);
    ensure!(!targets.is_empty(), "Device has no usable memory types");
    tracing::debug!("Exercising memory types {:?}", targets);

    let mut report = StressReport::default();
    let mut live: Vec<Live> = Vec::new();
    let mut queue = DeferredFreeQueue::new(config.frames_in_flight);

    for frame in 0..config.frames {
        report.frees += queue.process(&manager, frame)?;

        let fresh = (0..config.allocs_per_frame)
            .into_par_iter()
            .map(|i| {
                let mut rng = StdRng::seed_from_u64(config.seed ^ (frame << 32) ^ i as u64);
                allocate_one(&manager, &targets, config.max_size, &mut rng)
            })
            .collect::<anyhow::Result<Vec<_>>>()?;
        let fresh: Vec<Live> = fresh.into_iter().flatten().collect();
        report.allocations += fresh.len();
        live.extend(fresh);

        check_overlap(&live)?;
        if live.len() > report.peak_live {
            report.peak_live = live.len();
            report.peak_stats = manager.stats();
        }

        // Free about half of everything alive.
        let mut rng = StdRng::seed_from_u64(config.seed ^ frame.rotate_left(17));
        let (freed, kept): (Vec<Live>, Vec<Live>) =
            live.into_iter().partition(|_| rng.gen_bool(0.5));
        live = kept;
        for entry in freed {
            verify_tag(&manager, &entry)?;
            queue.queue(entry.handle, frame);
        }

        if frame % 30 == 0 {
            tracing::debug!("Frame {}: {}", frame, manager.stats().summary());
        }
    }

    for entry in live {
        verify_tag(&manager, &entry)?;
        queue.queue(entry.handle, config.frames);
    }
    report.frees += queue.flush(&manager)?;

    let stats = manager.stats();
    ensure!(
        stats.total_in_use() == 0 && stats.dedicated_count == 0,
        "Memory still in use after freeing everything: {}",
        stats.summary()
    );

    let trimmed = manager.trim_empty_chunks();
    tracing::debug!("Trimmed {} chunks", trimmed);
    manager.destroy();

    Ok(report)
}

/// Device-only, host, and small device-local host-visible types, when present.
fn target_memory_types(manager: &GpuMemoryManager<MockBackend>) -> Vec<u32> {
    let host = Flags::HOST_VISIBLE | Flags::HOST_COHERENT;
    let mut targets: Vec<u32> = [
        (Flags::DEVICE_LOCAL, Flags::HOST_VISIBLE),
        (host, Flags::DEVICE_LOCAL),
        (host | Flags::DEVICE_LOCAL, Flags::empty()),
    ]
    .into_iter()
    .filter_map(|(prefer, avoid)| manager.find_memory_type(u32::MAX, prefer, avoid))
    .collect();
    targets.dedup();
    targets
}

fn allocate_one(
    manager: &GpuMemoryManager<MockBackend>,
    targets: &[u32],
    max_size: u64,
    rng: &mut StdRng,
) -> anyhow::Result<Option<Live>> {
    let memory_type = targets[rng.gen_range(0..targets.len())];
    let alignment = ALIGNMENTS[rng.gen_range(0..ALIGNMENTS.len())];
    let limit = manager
        .max_suballocation_size(memory_type, alignment)
        .unwrap_or(0)
        .min(max_size);
    if limit == 0 {
        return Ok(None);
    }

    // Log-uniform sizes, so small requests dominate like in a real frame.
    let bits = u64::from(64 - limit.leading_zeros());
    let shift = rng.gen_range(0..bits);
    let size = rng.gen_range(1..=(1u64 << shift).min(limit));

    let result = if rng.gen_ratio(1, DEDICATED_RATE) {
        manager.allocate_memory_dedicated(memory_type, size, MockResource::Buffer(rng.gen()))
    } else {
        manager.allocate_memory(memory_type, size, alignment)
    };
    let handle = match result {
        Ok(handle) => handle,
        Err(MemoryError::OutOfDeviceMemory { .. }) => {
            tracing::warn!("Out of memory on type {} for {} bytes", memory_type, size);
            return Ok(None);
        }
        Err(e) => return Err(e.into()),
    };

    let mappable = !handle.is_dedicated()
        && manager
            .memory_type(memory_type)
            .is_some_and(gpumem::MemoryTypeInfo::is_host_visible);
    let tag = if mappable {
        let tag = rng.gen::<u8>();
        let ptr = manager.mapped_address(&handle)?;
        // SAFETY: The range [0, size) belongs to this allocation only.
        unsafe {
            ptr.as_ptr().write(tag);
            ptr.as_ptr().add(size as usize - 1).write(tag);
        }
        Some(tag)
    } else {
        None
    };

    Ok(Some(Live { handle, tag }))
}

/// Check that the bytes written at allocation time are still there.
fn verify_tag(manager: &GpuMemoryManager<MockBackend>, entry: &Live) -> anyhow::Result<()> {
    let Some(tag) = entry.tag else {
        return Ok(());
    };
    let ptr = manager.mapped_address(&entry.handle)?;
    let last = entry.handle.size() as usize - 1;
    // SAFETY: Same range that was written in `allocate_one`.
    let (first, end) = unsafe { (ptr.as_ptr().read(), ptr.as_ptr().add(last).read()) };
    ensure!(
        first == tag && end == tag,
        "Allocation at offset {} was overwritten",
        entry.handle.offset()
    );
    Ok(())
}

fn check_overlap(live: &[Live]) -> anyhow::Result<()> {
    let mut ranges: Vec<(u64, u64, u64)> = live
        .iter()
        .filter_map(|l| {
            let memory = l.handle.memory()?;
            Some((memory.0, l.handle.offset(), l.handle.size()))
        })
        .collect();
    ranges.sort_unstable();

    for pair in ranges.windows(2) {
        let (memory, offset, size) = pair[0];
        let (next_memory, next_offset, _) = pair[1];
        ensure!(
            memory != next_memory || offset + size <= next_offset,
            "Overlapping allocations in memory {} at offsets {} and {}",
            memory,
            offset,
            next_offset
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| (*s).to_string()).collect()
    }

    #[test]
    fn parses_arguments() {
        let config = StressConfig::parse(args(&[
            "--device",
            "rebar",
            "--frames",
            "10",
            "--release-empty",
        ]))
        .unwrap();
        assert_eq!(config.device, Device::Rebar);
        assert_eq!(config.frames, 10);
        assert!(config.release_empty);
        assert_eq!(config.allocs_per_frame, 512);
    }

    #[test]
    fn rejects_bad_arguments() {
        assert!(StressConfig::parse(args(&["--device", "cloud"])).is_err());
        assert!(StressConfig::parse(args(&["--frames"])).is_err());
        assert!(StressConfig::parse(args(&["--frames", "many"])).is_err());
        assert!(StressConfig::parse(args(&["--max-size", "0"])).is_err());
        assert!(StressConfig::parse(args(&["--bogus"])).is_err());
    }

    #[test]
    fn short_runs_succeed_on_every_device() {
        for device in [Device::Discrete, Device::Rebar, Device::Integrated] {
            for release_empty in [false, true] {
                let config = StressConfig {
                    device,
                    frames: 6,
                    allocs_per_frame: 64,
                    max_size: 512 * 1024,
                    release_empty,
                    ..StressConfig::default()
                };
                let report = run(&config).unwrap();
                assert!(report.allocations > 0);
                assert_eq!(report.allocations, report.frees);
                assert!(report.peak_stats.total_in_use() > 0);
            }
        }
    }

    #[test]
    fn sizes_stay_within_the_limit() {
        let manager = GpuMemoryManager::new(
            MockBackend::discrete(),
            ManagerConfig::default().with_oom_policy(OomPolicy::ReturnError),
        )
        .unwrap();
        let targets = target_memory_types(&manager);
        let max_size = 64 * 1024;

        for seed in 0..256 {
            let mut rng = StdRng::seed_from_u64(seed);
            let Some(entry) = allocate_one(&manager, &targets, max_size, &mut rng).unwrap() else {
                continue;
            };
            let size = entry.handle.size();
            assert!((1..=max_size).contains(&size), "size {size} from seed {seed}");
            verify_tag(&manager, &entry).unwrap();
            let mut handle = entry.handle;
            manager.free_memory(&mut handle).unwrap();
        }
        assert_eq!(manager.stats().total_in_use(), 0);
    }

    #[test]
    fn discrete_targets_three_types() {
        let manager =
            GpuMemoryManager::new(MockBackend::discrete(), ManagerConfig::default()).unwrap();
        assert_eq!(target_memory_types(&manager), vec![0, 1, 3]);
    }
}
