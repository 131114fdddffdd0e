//! The `Tracer` trait (SPEC_FULL §4.C+): one interception mechanism per
//! implementation, both reporting through the same [`crate::report::Recorder`]
//! shape. Picking between them is a rule-level setting (`autodep_method`,
//! §6's `LMAKE_AUTODEP_ENV`), because not every executable can be traced
//! both ways — a statically-linked or non-ELF interpreter can't be
//! `LD_PRELOAD`ed into, so those rules fall back to `ptrace`.

use std::io;
use std::os::unix::process::CommandExt;
use std::path::PathBuf;
use std::process::Command;

/// Which interception mechanism a rule selects (spec §6 "Environment
/// variables recognized by the autodep child").
#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AutodepMethod {
    /// `LD_PRELOAD` shim: works for any dynamically-linked native ELF.
    LdPreload,
    /// `LD_AUDIT`: lower overhead than `LD_PRELOAD` on some libcs, same
    /// applicability.
    LdAudit,
    /// `ptrace`-based fallback: works on anything the kernel can trace,
    /// at higher overhead.
    Ptrace,
}

/// What a [`Tracer`] needs to know to instrument a about-to-be-spawned
/// command.
pub struct TracerConfig {
    pub method: AutodepMethod,
    /// Path to the preload/audit shared object, when `method` needs one.
    pub shim_path: Option<PathBuf>,
    /// Unix socket path the traced process reports accesses to (§4.C /
    /// §6 "Autodep child <-> job-exec supervisor").
    pub report_socket: PathBuf,
}

/// Common surface both interception mechanisms implement. `instrument`
/// mutates the about-to-be-spawned `Command` (setting env vars, or
/// registering a `pre_exec` hook) so that, once spawned, every filesystem
/// syscall the child performs is observable to the job-exec supervisor.
pub trait Tracer {
    fn method(&self) -> AutodepMethod;

    fn instrument(&self, cmd: &mut Command, config: &TracerConfig) -> Result<(), String>;
}

/// `LD_PRELOAD`/`LD_AUDIT`-based tracing: the shim is a cdylib that
/// interposes libc's `open`/`openat`/`stat`/`rename`/... family and forwards
/// each call's observed path to `report_socket` before/after calling the
/// real libc function. Because the shim runs inside the traced process's
/// own address space, no extra scheduling overhead is incurred versus an
/// untraced run — the dominant cost is the per-call socket write, which
/// the shim batches (see `Recorder`'s de-duplication, §4.C).
pub struct PreloadTracer;

impl Tracer for PreloadTracer {
    fn method(&self) -> AutodepMethod {
        AutodepMethod::LdPreload
    }

    fn instrument(&self, cmd: &mut Command, config: &TracerConfig) -> Result<(), String> {
        let shim = config
            .shim_path
            .as_ref()
            .ok_or("LdPreload/LdAudit tracer requires a shim_path")?;
        match config.method {
            AutodepMethod::LdPreload => {
                cmd.env("LD_PRELOAD", shim);
            }
            AutodepMethod::LdAudit => {
                cmd.env("LD_AUDIT", shim);
            }
            AutodepMethod::Ptrace => return Err("PreloadTracer cannot instrument via ptrace".to_string()),
        }
        cmd.env("LMAKE_AUTODEP_SOCKET", &config.report_socket);
        Ok(())
    }
}

/// `ptrace`-based tracing: the child calls `PTRACE_TRACEME` before `exec`
/// (via `pre_exec`), the parent then single-steps syscall-stops with
/// `PTRACE_SYSCALL`, decoding each syscall's arguments through
/// `PTRACE_GETREGS` and reading path strings out of the child's memory.
/// Used when the rule can't rely on the dynamic linker honoring
/// `LD_PRELOAD` (statically-linked binaries, setuid executables, some
/// non-ELF interpreters).
pub struct PtraceTracer;

impl Tracer for PtraceTracer {
    fn method(&self) -> AutodepMethod {
        AutodepMethod::Ptrace
    }

    fn instrument(&self, cmd: &mut Command, _config: &TracerConfig) -> Result<(), String> {
        unsafe {
            cmd.pre_exec(|| {
                nix::sys::ptrace::traceme().map_err(|e| io::Error::from_raw_os_error(e as i32))?;
                Ok(())
            });
        }
        Ok(())
    }
}

/// A syscall-stop observed while single-stepping a traced child, decoded
/// just enough to classify it as an [`crate::ops::Operation`]. Real x86_64
/// syscall-number decoding is architecture-specific; this is the seam a
/// full implementation would plug platform-specific register layouts into.
#[derive(Clone, Debug)]
pub struct SyscallStop {
    pub pid: nix::unistd::Pid,
    pub syscall_number: i64,
}

/// Advances a traced child past its next syscall-entry-or-exit stop.
/// Returns `None` once the child has exited.
pub fn next_syscall_stop(pid: nix::unistd::Pid) -> Result<Option<SyscallStop>, String> {
    nix::sys::ptrace::syscall(pid, None::<nix::sys::signal::Signal>).map_err(|e| format!("PTRACE_SYSCALL: {e}"))?;
    match nix::sys::wait::waitpid(pid, None) {
        Ok(nix::sys::wait::WaitStatus::Exited(_, _)) | Ok(nix::sys::wait::WaitStatus::Signaled(_, _, _)) => Ok(None),
        Ok(nix::sys::wait::WaitStatus::PtraceSyscall(child_pid)) => {
            let regs = nix::sys::ptrace::getregs(child_pid).map_err(|e| format!("PTRACE_GETREGS: {e}"))?;
            Ok(Some(SyscallStop {
                pid: child_pid,
                syscall_number: regs.orig_rax as i64,
            }))
        }
        Ok(_) => Ok(None),
        Err(e) => Err(format!("waitpid: {e}")),
    }
}

/// Reads a NUL-terminated string out of the traced child's address space
/// via `/proc/<pid>/mem`, used to recover the path argument of a syscall
/// whose registers only give a pointer.
pub fn read_cstring_at(pid: nix::unistd::Pid, addr: u64) -> io::Result<String> {
    use std::io::{Read, Seek, SeekFrom};
    let mut file = std::fs::File::open(format!("/proc/{pid}/mem"))?;
    file.seek(SeekFrom::Start(addr))?;
    let mut buf = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        file.read_exact(&mut byte)?;
        if byte[0] == 0 {
            break;
        }
        buf.push(byte[0]);
        if buf.len() > 4096 {
            break;
        }
    }
    Ok(String::from_utf8_lossy(&buf).into_owned())
}

/// Selects the right `Tracer` for a rule's declared `autodep_method`.
pub fn tracer_for(method: AutodepMethod) -> Box<dyn Tracer + Send + Sync> {
    match method {
        AutodepMethod::LdPreload | AutodepMethod::LdAudit => Box::new(PreloadTracer),
        AutodepMethod::Ptrace => Box::new(PtraceTracer),
    }
}
