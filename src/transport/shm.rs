//! Shared-memory transport (§4.6): a control segment, a bulk transport
//! segment partitioned into per-worker slot pairs, and named semaphores
//! for rendezvous. Unix-only — the stale-segment guard and the named
//! semaphores in [`crate::sem`] are POSIX-specific.

#![cfg(unix)]

use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use parking_lot::Mutex;
use shared_memory::{Shmem, ShmemConf, ShmemError};

use crate::databuffer::DataBuffer;
use crate::sem::NamedSemaphore;
use crate::wire::HEADER_SIZE;

use super::ExchangeOutcome;

const CONTROL_SIZE: usize = 16; // pid (u32) + max_data_size (u32) + threads_num (u32) + reserved (u32)

fn open_or_create(name: &str, size: usize) -> Result<Shmem> {
    match ShmemConf::new().size(size).os_id(name).create() {
        Ok(s) => Ok(s),
        Err(ShmemError::MappingIdExists) => ShmemConf::new()
            .os_id(name)
            .open()
            .with_context(|| format!("opening existing shm segment `{name}`")),
        Err(e) => Err(e.into()),
    }
}

fn open_existing(name: &str) -> Result<Shmem> {
    ShmemConf::new()
        .os_id(name)
        .open()
        .with_context(|| format!("opening shm segment `{name}`"))
}

fn slot_len(max_data_size: usize) -> usize {
    HEADER_SIZE + max_data_size
}

/// A view over one `(input, output)` pair of byte ranges inside the bulk
/// transport segment, from one side's perspective. The client's output
/// range is the server's input range for the same slot, and vice versa.
struct SlotView {
    transport: *mut u8,
    slot_len: usize,
    slot_index: usize,
}

// The transport segment outlives every SlotView derived from it and each
// slot's byte range is touched by exactly one worker/client at a time,
// gated by the start/stop/used semaphores.
unsafe impl Send for SlotView {}
unsafe impl Sync for SlotView {}

impl SlotView {
    fn pair_base(&self) -> *mut u8 {
        unsafe { self.transport.add(self.slot_index * 2 * self.slot_len) }
    }

    fn range(&self, which: usize) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.pair_base().add(which * self.slot_len), self.slot_len) }
    }

    fn range_mut(&self, which: usize) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.pair_base().add(which * self.slot_len), self.slot_len) }
    }
}

fn is_process_alive(pid: u32) -> bool {
    unsafe { libc::kill(pid as libc::pid_t, 0) == 0 }
}

pub struct ShmServerTransport {
    _control: Shmem,
    _transport_seg: Shmem,
    buffers: Vec<Mutex<DataBuffer>>,
    slots: Vec<SlotView>,
    start: Vec<NamedSemaphore>,
    stop: Vec<NamedSemaphore>,
    used: Vec<NamedSemaphore>,
    access: NamedSemaphore,
}

impl ShmServerTransport {
    pub fn create(uri_name: &str, threads_num: usize, max_data_size: usize, clean: bool) -> Result<Self> {
        let control_name = format!("{uri_name}.control");
        if let Ok(existing) = open_existing(&control_name) {
            let bytes = unsafe { std::slice::from_raw_parts(existing.as_ptr(), CONTROL_SIZE) };
            let pid = u32::from_ne_bytes(bytes[0..4].try_into().unwrap());
            if pid != 0 && is_process_alive(pid) {
                bail!("a live uRPC server (pid {pid}) already owns shm segment `{uri_name}`");
            }
        }

        let control = open_or_create(&control_name, CONTROL_SIZE)?;
        let slen = slot_len(max_data_size);
        let transport_seg = open_or_create(&format!("{uri_name}.transport"), 2 * slen * threads_num)?;

        {
            let bytes = unsafe { std::slice::from_raw_parts_mut(control.as_ptr(), CONTROL_SIZE) };
            bytes[0..4].copy_from_slice(&(std::process::id()).to_ne_bytes());
            bytes[4..8].copy_from_slice(&(max_data_size as u32).to_ne_bytes());
            bytes[8..12].copy_from_slice(&(threads_num as u32).to_ne_bytes());
            bytes[12..16].copy_from_slice(&0u32.to_ne_bytes());
        }

        let mut start = Vec::with_capacity(threads_num);
        let mut stop = Vec::with_capacity(threads_num);
        let mut used = Vec::with_capacity(threads_num);
        for i in 0..threads_num {
            start.push(NamedSemaphore::create(&format!("{uri_name}.transport.{i}.start"), 0)?);
            stop.push(NamedSemaphore::create(&format!("{uri_name}.transport.{i}.stop"), 0)?);
            used.push(NamedSemaphore::create(&format!("{uri_name}.transport.{i}.used"), 1)?);
        }
        let access = NamedSemaphore::create(&format!("{uri_name}.access"), threads_num as u32)?;

        let slots = (0..threads_num)
            .map(|i| SlotView {
                transport: transport_seg.as_ptr(),
                slot_len: slen,
                slot_index: i,
            })
            .collect();
        let buffers = (0..threads_num)
            .map(|_| Mutex::new(DataBuffer::new(slen, clean)))
            .collect();

        Ok(ShmServerTransport {
            _control: control,
            _transport_seg: transport_seg,
            buffers,
            slots,
            start,
            stop,
            used,
            access,
        })
    }

    pub fn threads_num(&self) -> usize {
        self.buffers.len()
    }

    pub fn recv(&self, thread_id: usize) -> Result<bool> {
        if !self.start[thread_id].timed_wait(Duration::from_millis(500))? {
            return Ok(false);
        }
        let incoming = self.slots[thread_id].range(0).to_vec();
        let mut buf = self.buffers[thread_id].lock();
        buf.input_mut().header_slice_mut().copy_from_slice(&incoming[0..HEADER_SIZE]);
        buf.input_mut().set_data(&incoming[HEADER_SIZE..])?;
        Ok(true)
    }

    pub fn send(&self, thread_id: usize) -> Result<()> {
        let buf = self.buffers[thread_id].lock();
        let packet = buf.output().packet();
        let out = self.slots[thread_id].range_mut(1);
        out[0..packet.len()].copy_from_slice(packet);
        drop(buf);
        self.stop[thread_id].post()?;
        Ok(())
    }

    pub fn with_buffer<R>(&self, thread_id: usize, f: impl FnOnce(&mut DataBuffer) -> R) -> R {
        f(&mut self.buffers[thread_id].lock())
    }

    pub fn shutdown(&self) {}
}

pub struct ShmClientTransport {
    _control: Shmem,
    _transport_seg: Shmem,
    slot: SlotView,
    threads_num: usize,
    access: NamedSemaphore,
    used: Vec<NamedSemaphore>,
    start: Vec<NamedSemaphore>,
    stop: Vec<NamedSemaphore>,
}

impl ShmClientTransport {
    pub fn connect(uri_name: &str) -> Result<Self> {
        let control = open_existing(&format!("{uri_name}.control"))?;
        let bytes = unsafe { std::slice::from_raw_parts(control.as_ptr(), CONTROL_SIZE) };
        let max_data_size = u32::from_ne_bytes(bytes[4..8].try_into().unwrap()) as usize;
        let threads_num = u32::from_ne_bytes(bytes[8..12].try_into().unwrap()) as usize;
        let slen = slot_len(max_data_size);

        let transport_seg = open_existing(&format!("{uri_name}.transport"))?;
        let access = NamedSemaphore::open_existing(&format!("{uri_name}.access"))?;
        let mut used = Vec::with_capacity(threads_num);
        let mut start = Vec::with_capacity(threads_num);
        let mut stop = Vec::with_capacity(threads_num);
        for i in 0..threads_num {
            used.push(NamedSemaphore::open_existing(&format!("{uri_name}.transport.{i}.used"))?);
            start.push(NamedSemaphore::open_existing(&format!("{uri_name}.transport.{i}.start"))?);
            stop.push(NamedSemaphore::open_existing(&format!("{uri_name}.transport.{i}.stop"))?);
        }

        let slot = SlotView {
            transport: transport_seg.as_ptr(),
            slot_len: slen,
            slot_index: 0,
        };

        Ok(ShmClientTransport {
            _control: control,
            _transport_seg: transport_seg,
            slot,
            threads_num,
            access,
            used,
            start,
            stop,
        })
    }

    fn claim(&self, deadline: Instant) -> Result<Option<usize>> {
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(None);
            }
            if !self.access.timed_wait(remaining.min(Duration::from_millis(200)))? {
                continue;
            }
            for i in 0..self.threads_num {
                if self.used[i].try_wait()? {
                    return Ok(Some(i));
                }
            }
            // Held an access unit but found no free slot (transient race);
            // release it and retry.
            self.access.post()?;
        }
    }

    pub fn exchange(&mut self, buffer: &mut DataBuffer, timeout: Duration) -> Result<ExchangeOutcome> {
        let deadline = Instant::now() + timeout;
        let slot_index = match self.claim(deadline)? {
            Some(i) => i,
            None => return Ok(ExchangeOutcome::Timeout),
        };

        let view = SlotView {
            transport: self.slot.transport,
            slot_len: self.slot.slot_len,
            slot_index,
        };
        let packet = buffer.output().packet();
        let dst = view.range_mut(0); // client output == server input
        dst[0..packet.len()].copy_from_slice(packet);

        self.start[slot_index].post()?;
        let remaining = deadline.saturating_duration_since(Instant::now());
        let outcome = if !self.stop[slot_index].timed_wait(remaining)? {
            ExchangeOutcome::Timeout
        } else {
            let incoming = view.range(1).to_vec(); // client input == server output
            buffer.input_mut().header_slice_mut().copy_from_slice(&incoming[0..HEADER_SIZE]);
            match buffer.input_mut().set_data(&incoming[HEADER_SIZE..]) {
                Ok(()) => match buffer.input().read_header() {
                    Ok(_) => ExchangeOutcome::Delivered,
                    Err(_) => ExchangeOutcome::TransportError,
                },
                Err(_) => ExchangeOutcome::TransportError,
            }
        };

        self.used[slot_index].post()?;
        self.access.post()?;
        Ok(outcome)
    }
}
