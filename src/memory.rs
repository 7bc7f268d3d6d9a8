//! Tracee memory access through `/proc/<tid>/mem`.

use std::fs;
use std::io;
use std::os::unix::fs::FileExt;

use tracing::trace;

use crate::error::{Error, Result};
use crate::sys;
use crate::tracee::Tracee;

/// Size of the reads used to scan for the end of a C string.
const STRING_CHUNK: u64 = 128;

impl Tracee {
    /// Read tracee memory at `addr` into `buf`, returning the number of bytes read.
    ///
    /// Transfers happen page by page. A fault on the first page is an error, a fault on a
    /// later page ends the transfer with a short count.
    pub fn read_memory(&self, addr: u64, buf: &mut [u8]) -> Result<usize> {
        if !self.state.is_stopped() {
            return Err(self.invalid_state("read memory"));
        }

        let mem = fs::File::open(self.proc_mem_path())
            .map_err(|err| sys::proc_error(self.tid, err))?;

        transfer(addr, buf.len(), |offset, chunk_addr, chunk_len| {
            mem.read_at(&mut buf[offset..offset + chunk_len], chunk_addr)
        })
    }

    /// Read `len` bytes of tracee memory at `addr`. The result may be short.
    pub fn read_memory_vec(&self, addr: u64, len: usize) -> Result<Vec<u8>> {
        let mut data = vec![0; len];
        let len_read = self.read_memory(addr, &mut data)?;
        data.truncate(len_read);

        Ok(data)
    }

    /// Write `data` to tracee memory at `addr`, returning the number of bytes written.
    ///
    /// Faults are handled as for [`Tracee::read_memory`].
    pub fn write_memory(&self, addr: u64, data: &[u8]) -> Result<usize> {
        if !self.state.is_stopped() {
            return Err(self.invalid_state("write memory"));
        }

        let mem = fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open(self.proc_mem_path())
            .map_err(|err| sys::proc_error(self.tid, err))?;

        transfer(addr, data.len(), |offset, chunk_addr, chunk_len| {
            mem.write_at(&data[offset..offset + chunk_len], chunk_addr)
        })
    }

    /// Read a NUL-terminated string at `addr`, without its terminator.
    pub fn read_string(&self, addr: u64) -> Result<Vec<u8>> {
        let page_size = sys::page_size();
        let mut string = vec![];
        let mut chunk_addr = addr;

        loop {
            // Stay within the page, so a string ending just before unmapped memory is
            // read without faulting.
            let to_page_end = page_size - chunk_addr % page_size;
            let len = STRING_CHUNK.min(to_page_end) as usize;

            let mut chunk = vec![0; len];
            let len_read = self.read_memory(chunk_addr, &mut chunk)?;
            chunk.truncate(len_read);

            if let Some(nul) = chunk.iter().position(|b| *b == 0) {
                string.extend_from_slice(&chunk[..nul]);
                return Ok(string);
            }

            string.extend_from_slice(&chunk);

            chunk_addr = chunk_addr.checked_add(len_read as u64).ok_or(Error::Overflow {
                addr,
                len: string.len(),
            })?;
        }
    }

    fn proc_mem_path(&self) -> String {
        format!("/proc/{}/mem", self.tid.as_raw())
    }
}

// Split `[addr, addr + len)` at page boundaries and run `op` on each piece, in order.
//
// `op` gets the offset of the piece into the caller's buffer, its address and its length.
fn transfer<F>(addr: u64, len: usize, mut op: F) -> Result<usize>
where
    F: FnMut(usize, u64, usize) -> io::Result<usize>,
{
    if addr.checked_add(len as u64).is_none() {
        return Err(Error::Overflow { addr, len });
    }

    let page_size = sys::page_size();
    let mut done = 0;

    while done < len {
        let chunk_addr = addr + done as u64;
        let to_page_end = page_size - chunk_addr % page_size;
        let chunk_len = (len - done).min(to_page_end as usize);

        match op(done, chunk_addr, chunk_len) {
            Ok(0) => break,
            Ok(count) => done += count,
            Err(err) if is_fault(&err) => {
                if done == 0 {
                    return Err(Error::MemoryFault { addr: chunk_addr });
                }

                trace!(addr = chunk_addr, done, "short memory transfer");
                break;
            }
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(err.into()),
        }
    }

    Ok(done)
}

fn is_fault(err: &io::Error) -> bool {
    matches!(err.raw_os_error(), Some(libc::EIO) | Some(libc::EFAULT))
}
