//! Scenario execution
//!
//! A [`Scenario`] collects the program and machine description, opens a
//! [`DebugSession`] on a [`SimTarget`] built from them, and records what
//! every later command prints. Session commands are echoed as `> cmd`,
//! followed by their output and whatever the session reported meanwhile.

use crate::commands::{self, Command, Expectation, InfoKind, OpenOptions};
use crate::machine::SimTarget;
use crate::program::Program;
use common::{create_logger, Logger};
use debuginfo::DebugInfo;
use std::sync::atomic::AtomicBool;
use thiserror::Error;
use warpdbg::{
    AutostepOutcome, BreakpointId, CodeInfo, CoordIterator, Coords, DebugError, DebugSession, Focus, Inspector,
    LaneMask, SelectFlags, SessionConfig, SourceMapper, StepUnit, TargetError,
};

#[derive(Debug, Error)]
pub enum ScriptError {
    #[error("{0}")]
    Invalid(String),
    #[error(transparent)]
    Debug(#[from] DebugError),
    #[error(transparent)]
    Target(#[from] TargetError),
    #[error("expected {expected}, got {actual}")]
    Mismatch { expected: String, actual: String },
    #[error("line {line}: {source}")]
    Line { line: usize, source: Box<ScriptError> },
}

pub type Result<T> = std::result::Result<T, ScriptError>;

fn expect_eq(expected: impl ToString, actual: impl ToString) -> Result<()> {
    let (expected, actual) = (expected.to_string(), actual.to_string());
    if expected == actual {
        Ok(())
    } else {
        Err(ScriptError::Mismatch { expected, actual })
    }
}

/// A scenario under construction or being driven
pub struct Scenario {
    program: Program,
    machine: Option<SimTarget>,
    session: Option<DebugSession<SimTarget>>,
    inst_size: Option<u32>,
    output: Vec<String>,
    log: Logger,
}

impl Default for Scenario {
    fn default() -> Self {
        Self::new()
    }
}

impl Scenario {
    pub fn new() -> Self {
        Self {
            program: Program::new(),
            machine: Some(SimTarget::new(DebugInfo::default())),
            session: None,
            inst_size: None,
            output: Vec::new(),
            log: create_logger("script"),
        }
    }

    /// Everything printed so far
    pub fn output(&self) -> &[String] {
        &self.output
    }

    pub fn session(&self) -> Option<&DebugSession<SimTarget>> {
        self.session.as_ref()
    }

    fn session_mut(&mut self) -> Result<&mut DebugSession<SimTarget>> {
        self.session
            .as_mut()
            .ok_or_else(|| ScriptError::Invalid("no session; use `open` first".to_string()))
    }

    fn target_mut(&mut self) -> Result<&mut SimTarget> {
        match (&mut self.session, &mut self.machine) {
            (Some(s), _) => Ok(s.api_mut()),
            (None, Some(m)) => Ok(m),
            (None, None) => Err(ScriptError::Invalid("no machine".to_string())),
        }
    }

    /// Run one command line.
    pub fn execute_line(&mut self, line: &str) -> Result<()> {
        let cmd = commands::parse(line);
        if !cmd.is_setup() {
            self.output.push(format!("> {}", line.trim()));
        }
        common::log!(self.log, "{:?}", cmd);
        let result = self.execute(cmd);
        if let Some(s) = self.session.as_mut() {
            self.output.extend(s.take_messages());
        }
        self.output.extend(result?);
        Ok(())
    }

    fn execute(&mut self, cmd: Command) -> Result<Vec<String>> {
        let mut out = Vec::new();
        match cmd {
            Command::Empty => {}
            Command::Unknown(what) => return Err(ScriptError::Invalid(format!("unknown command: {}", what))),

            Command::Device(spec) => {
                self.inst_size.get_or_insert(spec.inst_size);
                self.target_mut()?.add_device(spec);
            }
            Command::Function { name, file, line, start, end, kind } => {
                self.ensure_not_open()?;
                self.program.function(&name, &file, line, start, end, kind);
            }
            Command::Line { addr, line } => {
                self.ensure_not_open()?;
                self.program.line(addr, line).map_err(ScriptError::Invalid)?;
            }
            Command::Insn { addr, text, flags, target } => {
                self.ensure_not_open()?;
                self.program.insn(addr, text, flags, target).map_err(ScriptError::Invalid)?;
            }
            Command::Grid { info, status } => self.target_mut()?.launch_grid(info, status),
            Command::Warp { dev, sm, wp, grid_id, block, pc, lanes, thread } => {
                self.target_mut()?.add_warp(dev, sm, wp, grid_id, block, pc, lanes, thread)?;
            }
            Command::Diverge { dev, sm, wp, mask } => {
                let warp = self
                    .target_mut()?
                    .warp_mut(dev, sm, wp)
                    .ok_or_else(|| ScriptError::Invalid(format!("no warp {}/{}/{}", dev, sm, wp)))?;
                warp.branch_mask = LaneMask::from_bits(mask);
            }
            Command::FailSteps(fail) => self.target_mut()?.set_fail_steps(fail),

            Command::Open(opts) => out.push(self.open(opts)?),
            Command::Break(location, autostep) => {
                let s = self.session_mut()?;
                let id = s.add_breakpoint(location, autostep)?;
                let Some(bp) = s.breakpoints().get(id).cloned() else {
                    return Err(DebugError::UnknownBreakpoint(id.0).into());
                };
                s.api_mut().set_breakpoint(bp.address);
                let mut line = format!("Breakpoint {} at 0x{:x}", id, bp.address);
                if let Some(loc) = s.code().line_for_pc(bp.address) {
                    line.push_str(&format!(": file {}, line {}", loc.file, loc.line));
                }
                out.push(line);
            }
            Command::Enable(n) => {
                let s = self.session_mut()?;
                s.enable_breakpoint(BreakpointId(n))?;
                if let Some(addr) = s.breakpoints().get(BreakpointId(n)).map(|bp| bp.address) {
                    s.api_mut().set_breakpoint(addr);
                }
            }
            Command::Disable(n) => {
                let s = self.session_mut()?;
                s.disable_breakpoint(BreakpointId(n))?;
                if let Some(addr) = s.breakpoints().get(BreakpointId(n)).map(|bp| bp.address) {
                    unplant_if_unused(s, addr);
                }
            }
            Command::Delete(n) => {
                let s = self.session_mut()?;
                let bp = s.delete_breakpoint(BreakpointId(n))?;
                unplant_if_unused(s, bp.address);
                out.push(format!("Deleted breakpoint {}", n));
            }
            Command::Events => {
                let s = self.session_mut()?;
                let n = s.process_events()?;
                s.update_terminated()?;
                out.push(format!("{} event(s)", n));
            }
            Command::Focus { dev, sm, wp, ln } => {
                let s = self.session_mut()?;
                s.set_focus_device(Coords::physical(dev, sm, wp, ln))?;
                out.push(describe_focus(s.focus()));
            }
            Command::FocusHost(pc) => {
                let s = self.session_mut()?;
                s.set_focus_host(pc);
                out.push(describe_focus(s.focus()));
            }
            Command::Autostep(pc) => {
                let s = self.session_mut()?;
                let status = s.initialize_autostep(pc)?;
                out.push(format!("Autostep {:?} ({:?})", status, s.autostep_phase()));
            }
            Command::RunAutostep { interrupted } => {
                let stop = AtomicBool::new(interrupted);
                let outcome = self.session_mut()?.run_autostep(&stop)?;
                match outcome {
                    AutostepOutcome::Completed => out.push("Autostep completed".to_string()),
                    AutostepOutcome::Exception(e) => out.push(format!("Autostep stopped: {}", e.kind)),
                    AutostepOutcome::Interrupted => out.push("Autostep stopped by interrupt".to_string()),
                    AutostepOutcome::Fallback { resume_to } => {
                        out.push(format!("Autostep fell back to a normal resume to 0x{:x}", resume_to));
                        out.extend(self.resume_to(resume_to)?);
                    }
                }
            }
            Command::Step { dev, sm, wp, count } => {
                let moved = self.session_mut()?.warp_single_step(dev, sm, wp, count)?;
                out.push(format!("Stepped warps {}", moved));
            }
            Command::Resume => out.extend(self.resume()?),
            Command::Info(kind) => out.extend(self.info(kind)?),
            Command::ResetCalls => self.target_mut()?.reset_calls(),
            Command::Expect(expectation) => self.check(expectation)?,
        }
        Ok(out)
    }

    fn ensure_not_open(&self) -> Result<()> {
        if self.session.is_some() {
            return Err(ScriptError::Invalid("the program cannot change once the session is open".to_string()));
        }
        Ok(())
    }

    fn open(&mut self, opts: OpenOptions) -> Result<String> {
        let mut machine = self
            .machine
            .take()
            .ok_or_else(|| ScriptError::Invalid("session already open".to_string()))?;
        let info = self.program.build(self.inst_size.unwrap_or(16));
        machine.load_program(info.clone());

        let mut config = SessionConfig::default();
        if let Some(v) = opts.optimizations {
            config.single_stepping_optimizations = v;
        }
        if let Some(v) = opts.preemption {
            config.software_preemption = v;
        }

        let mut session = DebugSession::open(machine, Box::new(SourceMapper::new(info)), config)?;
        // attaching stops the devices
        session.suspend()?;
        let devices = session.device_count();
        self.session = Some(session);
        Ok(format!("Session open with {} device(s)", devices))
    }

    /// Resume every device, stop them again and report where they stopped.
    fn resume(&mut self) -> Result<Vec<String>> {
        let s = self.session_mut()?;
        s.update_terminated()?;
        s.resume()?;
        s.suspend()?;
        let events = s.process_events()?;
        s.update_terminated()?;
        let mut out = vec![format!("Stopped, {} event(s)", events)];

        let broken = CoordIterator::warps(Coords::wildcard(), SelectFlags::VALID | SelectFlags::BREAKPOINT).collect(s)?;
        if let Some(first) = broken.first() {
            if let (Some(dev), Some(sm), Some(wp)) = (first.dev, first.sm, first.wp) {
                let pc = s.warp_active_virtual_pc(dev, sm, wp)?;
                if let Some(id) = s.breakpoint_hit(pc) {
                    out.push(format!("Breakpoint {} hit at 0x{:x}, {} warp(s) stopped", id, pc, broken.len()));
                }
            }
        }
        Ok(out)
    }

    /// Resume with a temporary breakpoint at `pc`
    fn resume_to(&mut self, pc: u64) -> Result<Vec<String>> {
        self.session_mut()?.api_mut().set_breakpoint(pc);
        let out = self.resume();
        unplant_if_unused(self.session_mut()?, pc);
        out
    }

    fn info(&mut self, kind: InfoKind) -> Result<Vec<String>> {
        let s = self.session_mut()?;
        let mut out = Vec::new();
        match kind {
            InfoKind::Devices => {
                for d in Inspector::devices(s)? {
                    let mut line = format!(
                        "Device {} {} {}: {} SMs x {} warps x {} lanes, active SMs {}",
                        d.dev, d.device_type, d.sm_type, d.num_sms, d.num_warps, d.num_lanes, d.active_sms
                    );
                    if d.has_exception {
                        line.push_str(", exception");
                    }
                    if d.suspended {
                        line.push_str(", suspended");
                    }
                    out.push(line);
                }
            }
            InfoKind::Sms(dev) => {
                for i in Inspector::sms(s, dev)? {
                    out.push(format!(
                        "SM {}: valid {} broken {}{}",
                        i.sm,
                        i.valid_warps,
                        i.broken_warps,
                        if i.has_exception { " exception" } else { "" }
                    ));
                }
            }
            InfoKind::Warps => {
                for w in Inspector::warps(s, Coords::wildcard())? {
                    let mut line = format!(
                        "Warp {}/{}/{} kernel {} block {} active {}",
                        w.dev, w.sm, w.wp, w.kernel, w.block_idx, w.active_lanes
                    );
                    if let Some(pc) = w.active_pc {
                        line.push_str(&format!(" pc 0x{:x}", pc));
                    }
                    if !w.divergent_lanes.is_empty() {
                        line.push_str(&format!(" divergent {}", w.divergent_lanes));
                    }
                    if let Some(pc) = w.error_pc {
                        line.push_str(&format!(" error at 0x{:x}", pc));
                    }
                    out.push(line);
                }
            }
            InfoKind::Lanes { sm, wp } => {
                let mut filter = Coords::wildcard();
                filter.sm = sm;
                filter.wp = wp;
                for l in Inspector::lanes(s, filter)? {
                    let c = l.coords;
                    let mut line = format!(
                        "Lane {}/{}/{}/{} pc 0x{:x}",
                        c.dev.unwrap_or(0),
                        c.sm.unwrap_or(0),
                        c.wp.unwrap_or(0),
                        c.ln.unwrap_or(0),
                        l.pc
                    );
                    if let Some(t) = c.thread_idx {
                        line.push_str(&format!(" thread {}", t));
                    }
                    if !l.active {
                        line.push_str(" divergent");
                    }
                    if !l.exception.is_none() {
                        line.push_str(&format!(" {}", l.exception));
                    }
                    out.push(line);
                }
            }
            InfoKind::Kernels => {
                for k in Inspector::kernels(s)? {
                    let mut line = format!(
                        "Kernel {} {}{} device {} grid {} level {} {:?} SMs {}",
                        k.id, k.name, k.dimensions, k.dev, k.grid_id, k.depth, k.status, k.sms
                    );
                    if let Some(parent) = k.parent {
                        line.push_str(&format!(" parent {}", parent));
                    }
                    out.push(line);
                }
            }
            InfoKind::Breakpoints => {
                for bp in s.breakpoints().iter() {
                    let mut line = format!("Breakpoint {} at {} (0x{:x}) hits {}", bp.id, bp.location, bp.address, bp.hit_count);
                    if !bp.enabled {
                        line.push_str(" disabled");
                    }
                    if let Some(len) = bp.autostep {
                        let unit = match len.unit {
                            StepUnit::Lines => "lines",
                            StepUnit::Instructions => "instructions",
                        };
                        line.push_str(&format!(" autostep {} {}", len.count, unit));
                    }
                    out.push(line);
                }
            }
            InfoKind::Autostep => {
                match s.autostep_state() {
                    Some(st) => {
                        let mut line = format!(
                            "Autostep {}: {} of {} left, 0x{:x}..0x{:x}",
                            st.breakpoint, st.remaining, st.length, st.cur_pc, st.end_pc
                        );
                        if let Some(d) = &st.device {
                            let c = d.cur_coords;
                            line.push_str(&format!(
                                " on warp {}/{}/{}",
                                c.dev.unwrap_or(0),
                                c.sm.unwrap_or(0),
                                c.wp.unwrap_or(0)
                            ));
                        }
                        out.push(line);
                    }
                    None => out.push(format!("Autostep {:?}", s.autostep_phase())),
                }
                if let Some(step) = s.last_step() {
                    out.push(format!(
                        "Last step {}/{}/{} from 0x{:x} lanes {}",
                        step.dev, step.sm, step.wp, step.pc, step.stepped_lanes
                    ));
                }
            }
            InfoKind::Focus => out.push(describe_focus(s.focus())),
            InfoKind::Calls(Some(name)) => out.push(format!("{}: {}", name, s.api().calls(&name))),
            InfoKind::Calls(None) => out.push(format!("total: {}", s.api().total_calls())),
        }
        Ok(out)
    }

    fn check(&mut self, expectation: Expectation) -> Result<()> {
        let s = self.session_mut()?;
        match expectation {
            Expectation::Calls { name, count } => expect_eq(count, s.api().calls(&name)),
            Expectation::Pc { dev, sm, wp, pc } => {
                let actual = s.api().warp(dev, sm, wp).and_then(|w| w.pc());
                expect_eq(format!("0x{:x}", pc), actual.map_or("none".to_string(), |a| format!("0x{:x}", a)))
            }
            Expectation::Phase(phase) => expect_eq(phase, format!("{:?}", s.autostep_phase())),
            Expectation::Kernels(n) => expect_eq(n, s.kernels().len()),
        }
    }
}

/// Stop trapping on `addr` when no enabled breakpoint remains there.
fn unplant_if_unused(s: &mut DebugSession<SimTarget>, addr: u64) {
    if !s.breakpoints().iter().any(|bp| bp.enabled && bp.address == addr) {
        s.api_mut().clear_breakpoint(addr);
    }
}

fn describe_focus(focus: Option<&Focus>) -> String {
    match focus {
        Some(Focus::Device(c)) => format!("Focus: {}", c),
        Some(Focus::Host { pc }) => format!("Focus: host at 0x{:x}", pc),
        None => "No focus".to_string(),
    }
}

/// Run every line of `script`, returning what it printed.
pub fn run_commands(script: &str) -> Result<Vec<String>> {
    let mut scenario = Scenario::new();
    for (line_num, line) in script.lines().enumerate() {
        if let Err(e) = scenario.execute_line(line) {
            return Err(ScriptError::Line { line: line_num + 1, source: Box::new(e) });
        }
    }
    Ok(scenario.output)
}
