//! Built-in memory stress workload.
//!
//! Runs as the container's PID 1 for the memory self-test. Every step
//! allocates a fixed chunk and writes to each of its pages so the memory
//! is actually charged to the control group rather than merely reserved.

use std::io::Write;

use nsbox_common::constants::MIB;
use nsbox_common::spec::StressPlan;

/// Stride used to touch memory; one write per page is enough to fault it in.
const PAGE_STRIDE: usize = 4096;

/// Grows resident memory in steps until `plan.target_bytes` is reached.
///
/// Progress is written to `out` after each step. Returns `0` when the
/// target was reached, which under a working memory ceiling never happens:
/// the kernel kills the process first. Returns `1` if the allocator itself
/// refuses memory.
pub fn run_memory_stress(plan: &StressPlan, out: &mut impl Write) -> i32 {
    let Ok(step) = usize::try_from(plan.step_bytes) else {
        let _ = writeln!(out, "memory-stress: step of {} bytes is too large", plan.step_bytes);
        return 1;
    };
    let mut held: Vec<Vec<u8>> = Vec::new();
    let mut total: u64 = 0;

    while total < plan.target_bytes {
        let mut chunk: Vec<u8> = Vec::new();
        if chunk.try_reserve_exact(step).is_err() {
            let _ = writeln!(out, "memory-stress: allocation refused at {}", describe(total));
            return 1;
        }
        chunk.resize(step, 0);
        for offset in (0..step).step_by(PAGE_STRIDE) {
            chunk[offset] = 1;
        }
        held.push(std::hint::black_box(chunk));
        total = total.saturating_add(plan.step_bytes);

        let _ = writeln!(out, "memory-stress: holding {}", describe(total));
        let _ = out.flush();
    }

    let _ = writeln!(
        out,
        "memory-stress: reached target of {} without being stopped",
        describe(plan.target_bytes)
    );
    let _ = out.flush();
    0
}

fn describe(bytes: u64) -> String {
    if bytes >= MIB && bytes % MIB == 0 {
        format!("{} MiB", bytes / MIB)
    } else {
        format!("{bytes} bytes")
    }
}
