//! Command parsing for scenario scripts
//!
//! A scenario first describes the program and the machine (`function`,
//! `line`, `insn`, `device`, `grid`, `warp`), then `open`s a debug session
//! and drives it. Numbers are decimal or `0x` hex; options are `key=value`.

use debuginfo::{InstructionFlags, SymbolKind};
use warpdbg::{
    AutostepLength, BreakLocation, DeviceSpec, Dim3, GridInfo, GridStatus, KernelOrigin, KernelType,
};

/// A parsed scenario command
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    /// Add a device
    Device(DeviceSpec),
    /// Start a function covering `[start, end)`
    Function { name: String, file: String, line: u32, start: u64, end: u64, kind: SymbolKind },
    /// Map an address of the current function to a source line
    Line { addr: u64, line: u32 },
    /// Describe the instruction at an address
    Insn { addr: u64, text: String, flags: InstructionFlags, target: Option<u64> },
    /// Launch a grid
    Grid { info: GridInfo, status: GridStatus },
    /// Place a warp
    Warp { dev: u32, sm: u32, wp: u32, grid_id: u64, block: Dim3, pc: u64, lanes: u32, thread: u32 },
    /// Lanes of a warp that take branches
    Diverge { dev: u32, sm: u32, wp: u32, mask: u64 },
    /// Make step requests fail
    FailSteps(bool),
    /// Open the debug session
    Open(OpenOptions),
    /// Set a breakpoint, optionally with an autostep region
    Break(BreakLocation, Option<AutostepLength>),
    Enable(u32),
    Disable(u32),
    Delete(u32),
    /// Handle queued events
    Events,
    /// Focus a lane
    Focus { dev: u32, sm: u32, wp: u32, ln: u32 },
    /// Focus the host at a PC
    FocusHost(u64),
    /// Start the autostep at a PC
    Autostep(u64),
    /// Drive the autostep to completion, optionally pre-interrupted
    RunAutostep { interrupted: bool },
    /// Single-step a warp
    Step { dev: u32, sm: u32, wp: u32, count: u32 },
    /// Resume all devices and stop them again
    Resume,
    /// Show state
    Info(InfoKind),
    /// Forget counted target calls
    ResetCalls,
    /// Check a counter, PC or phase
    Expect(Expectation),
    /// Empty line or comment
    Empty,
    /// Unknown or malformed command
    Unknown(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct OpenOptions {
    pub optimizations: Option<bool>,
    pub preemption: Option<bool>,
}

/// Kind of info to display
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InfoKind {
    Devices,
    Sms(u32),
    Warps,
    Lanes { sm: Option<u32>, wp: Option<u32> },
    Kernels,
    Breakpoints,
    Autostep,
    Focus,
    Calls(Option<String>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Expectation {
    Calls { name: String, count: u32 },
    Pc { dev: u32, sm: u32, wp: u32, pc: u64 },
    Phase(String),
    Kernels(usize),
}

impl Command {
    /// Commands that describe the machine rather than drive the session.
    pub fn is_setup(&self) -> bool {
        matches!(
            self,
            Command::Device(_)
                | Command::Function { .. }
                | Command::Line { .. }
                | Command::Insn { .. }
                | Command::Grid { .. }
                | Command::Warp { .. }
                | Command::Diverge { .. }
                | Command::Empty
        )
    }
}

/// Parse a decimal or `0x` hex number.
pub fn parse_num(s: &str) -> Option<u64> {
    let s = s.trim();
    match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16).ok(),
        None => s.parse().ok(),
    }
}

fn num<T: TryFrom<u64>>(s: &str) -> Option<T> {
    parse_num(s).and_then(|v| T::try_from(v).ok())
}

fn parse_dim3(s: &str) -> Option<Dim3> {
    let parts: Vec<u32> = s.split(',').map(num).collect::<Option<_>>()?;
    match parts[..] {
        [x] => Some(Dim3::new(x, 1, 1)),
        [x, y] => Some(Dim3::new(x, y, 1)),
        [x, y, z] => Some(Dim3::new(x, y, z)),
        _ => None,
    }
}

fn parse_flag(s: &str) -> Option<bool> {
    match s {
        "on" | "true" | "1" => Some(true),
        "off" | "false" | "0" => Some(false),
        _ => None,
    }
}

/// Positional arguments and `key=value` options of a command line
struct Args<'a> {
    positional: Vec<&'a str>,
    options: Vec<(&'a str, &'a str)>,
}

impl<'a> Args<'a> {
    fn split(args: &'a str) -> Self {
        let mut positional = Vec::new();
        let mut options = Vec::new();
        for word in args.split_whitespace() {
            match word.split_once('=') {
                Some((k, v)) => options.push((k, v)),
                None => positional.push(word),
            }
        }
        Self { positional, options }
    }

    fn option(&self, key: &str) -> Option<&'a str> {
        self.options.iter().find(|(k, _)| *k == key).map(|(_, v)| *v)
    }

    fn has(&self, word: &str) -> bool {
        self.positional.contains(&word)
    }

    fn nums<T: TryFrom<u64>>(&self, n: usize) -> Option<Vec<T>> {
        if self.positional.len() < n {
            return None;
        }
        self.positional[..n].iter().map(|s| num(s)).collect()
    }
}

/// Parse a command line into a Command
pub fn parse(line: &str) -> Command {
    let line = line.trim();

    if line.starts_with('#') || line.is_empty() {
        return Command::Empty;
    }

    let mut parts = line.splitn(2, char::is_whitespace);
    let cmd = parts.next().unwrap_or("");
    let args = parts.next().unwrap_or("").trim();

    let parsed = match cmd {
        "device" => parse_device(args),
        "function" => parse_function(args),
        "line" => parse_line(args),
        "insn" => parse_insn(args),
        "grid" => parse_grid(args),
        "warp" => parse_warp(args),
        "diverge" => parse_diverge(args),
        "fail-steps" => parse_flag(args).map(Command::FailSteps),
        "open" => parse_open(args),
        "break" | "b" => parse_break(args),
        "enable" => num(args).map(Command::Enable),
        "disable" => num(args).map(Command::Disable),
        "delete" | "d" => num(args).map(Command::Delete),
        "events" => Some(Command::Events),
        "focus" => parse_focus(args),
        "autostep" => parse_num(args).map(Command::Autostep),
        "run-autostep" => Some(Command::RunAutostep { interrupted: args == "interrupted" }),
        "step" => parse_step(args),
        "resume" | "continue" | "c" => Some(Command::Resume),
        "info" | "i" => parse_info(args),
        "reset-calls" => Some(Command::ResetCalls),
        "expect" => parse_expect(args),
        _ => return Command::Unknown(cmd.to_string()),
    };
    parsed.unwrap_or_else(|| Command::Unknown(format!("malformed command: {}", line)))
}

/// `device <sm_type> sms=N warps=N lanes=N [regs=N] [preds=N] [insn=N] [name=S]`
fn parse_device(args: &str) -> Option<Command> {
    let a = Args::split(args);
    let sm_type = a.positional.first()?.to_string();
    let opt = |key: &str, default: u32| match a.option(key) {
        Some(v) => num(v),
        None => Some(default),
    };
    Some(Command::Device(DeviceSpec {
        num_sms: opt("sms", 1)?,
        num_warps: opt("warps", 1)?,
        num_lanes: opt("lanes", 32)?,
        num_registers: opt("regs", 64)?,
        num_predicates: opt("preds", 7)?,
        device_type: a.option("name").unwrap_or("sim").to_string(),
        sm_type,
        inst_size: opt("insn", 16)?,
    }))
}

/// `function <name> <file>:<line> <start> <end> [device]`
fn parse_function(args: &str) -> Option<Command> {
    let a = Args::split(args);
    let [name, decl, start, end, ..] = a.positional[..] else {
        return None;
    };
    let (file, line) = decl.rsplit_once(':')?;
    Some(Command::Function {
        name: name.to_string(),
        file: file.to_string(),
        line: num(line)?,
        start: parse_num(start)?,
        end: parse_num(end)?,
        kind: if a.has("device") { SymbolKind::Function } else { SymbolKind::Kernel },
    })
}

/// `line <addr> <line>`
fn parse_line(args: &str) -> Option<Command> {
    let a = Args::split(args);
    let [addr, line] = a.positional[..] else {
        return None;
    };
    Some(Command::Line { addr: parse_num(addr)?, line: num(line)? })
}

/// `insn <addr> (nop | branch T | call T | ret | exit | barrier | trap [kind])`
fn parse_insn(args: &str) -> Option<Command> {
    let a = Args::split(args);
    let addr = parse_num(a.positional.first()?)?;
    let op = a.positional.get(1).copied().unwrap_or("nop");
    let target = a.positional.get(2).and_then(|t| parse_num(t));
    let (text, flags) = match op {
        "nop" => ("NOP".to_string(), InstructionFlags::empty()),
        "branch" => (format!("BRA 0x{:x}", target?), InstructionFlags::BRANCH),
        "call" => (format!("CALL 0x{:x}", target?), InstructionFlags::CALL),
        "ret" => ("RET".to_string(), InstructionFlags::RETURN),
        "exit" => ("EXIT".to_string(), InstructionFlags::EXIT),
        "barrier" => ("BAR.SYNC".to_string(), InstructionFlags::BARRIER),
        "trap" => {
            let kind = a.positional.get(2).copied().unwrap_or("illegal-address");
            (format!("TRAP {}", kind), InstructionFlags::TRAP)
        }
        _ => return None,
    };
    let target = if flags.intersects(InstructionFlags::BRANCH | InstructionFlags::CALL) { target } else { None };
    Some(Command::Insn { addr, text, flags, target })
}

fn parse_status(s: &str) -> Option<GridStatus> {
    Some(match s {
        "pending" => GridStatus::Pending,
        "active" => GridStatus::Active,
        "sleeping" => GridStatus::Sleeping,
        "terminated" => GridStatus::Terminated,
        "undetermined" => GridStatus::Undetermined,
        "invalid" => GridStatus::Invalid,
        _ => return None,
    })
}

/// `grid <dev> <id> entry=A [grid=X,Y,Z] [block=X,Y,Z] [parent=N] [system] [device-launch] [status=S]`
fn parse_grid(args: &str) -> Option<Command> {
    let a = Args::split(args);
    let ids: Vec<u64> = a.nums(2)?;
    let parent_grid_id = match a.option("parent") {
        Some(p) => Some(parse_num(p)?),
        None => None,
    };
    let origin = if a.has("device-launch") || parent_grid_id.is_some() {
        KernelOrigin::Device
    } else {
        KernelOrigin::Host
    };
    let info = GridInfo {
        dev: u32::try_from(ids[0]).ok()?,
        grid_id: ids[1],
        function_entry: parse_num(a.option("entry")?)?,
        context: a.option("context").and_then(parse_num).unwrap_or(1),
        module: a.option("module").and_then(parse_num).unwrap_or(1),
        grid_dim: parse_dim3(a.option("grid").unwrap_or("1"))?,
        block_dim: parse_dim3(a.option("block").unwrap_or("32"))?,
        kernel_type: if a.has("system") { KernelType::System } else { KernelType::Application },
        origin,
        parent_grid_id,
        args: a.option("args").map(str::to_string),
    };
    let status = parse_status(a.option("status").unwrap_or("active"))?;
    Some(Command::Grid { info, status })
}

/// `warp <dev> <sm> <wp> grid=N pc=A [block=X,Y,Z] [lanes=N] [thread=N]`
fn parse_warp(args: &str) -> Option<Command> {
    let a = Args::split(args);
    let p: Vec<u32> = a.nums(3)?;
    Some(Command::Warp {
        dev: p[0],
        sm: p[1],
        wp: p[2],
        grid_id: parse_num(a.option("grid")?)?,
        block: parse_dim3(a.option("block").unwrap_or("0,0,0"))?,
        pc: parse_num(a.option("pc")?)?,
        lanes: num(a.option("lanes").unwrap_or("32"))?,
        thread: num(a.option("thread").unwrap_or("0"))?,
    })
}

/// `diverge <dev> <sm> <wp> <mask>`
fn parse_diverge(args: &str) -> Option<Command> {
    let a = Args::split(args);
    let p: Vec<u64> = a.nums(4)?;
    Some(Command::Diverge {
        dev: u32::try_from(p[0]).ok()?,
        sm: u32::try_from(p[1]).ok()?,
        wp: u32::try_from(p[2]).ok()?,
        mask: p[3],
    })
}

/// `open [optimizations=on|off] [preemption=on|off]`
fn parse_open(args: &str) -> Option<Command> {
    let a = Args::split(args);
    let flag = |key: &str| match a.option(key) {
        Some(v) => parse_flag(v).map(Some),
        None => Some(None),
    };
    Some(Command::Open(OpenOptions {
        optimizations: flag("optimizations")?,
        preemption: flag("preemption")?,
    }))
}

/// `break (0xADDR | file:line | function) [lines=N | insns=N]`
fn parse_break(args: &str) -> Option<Command> {
    let a = Args::split(args);
    let spec = *a.positional.first()?;

    let addr = spec.strip_prefix('*').unwrap_or(spec);
    let location = if addr.starts_with("0x") {
        BreakLocation::Address(parse_num(addr)?)
    } else if let Some((file, line)) = spec.rsplit_once(':').and_then(|(f, l)| Some((f, num(l)?))) {
        BreakLocation::Line { file: file.to_string(), line }
    } else {
        BreakLocation::Function(spec.to_string())
    };

    let autostep = match (a.option("lines"), a.option("insns")) {
        (Some(n), None) => Some(AutostepLength::lines(num(n)?)),
        (None, Some(n)) => Some(AutostepLength::instructions(num(n)?)),
        (None, None) => None,
        (Some(_), Some(_)) => return None,
    };
    Some(Command::Break(location, autostep))
}

/// `focus <dev> <sm> <wp> <ln>` or `focus host <pc>`
fn parse_focus(args: &str) -> Option<Command> {
    if let Some(pc) = args.strip_prefix("host") {
        return parse_num(pc).map(Command::FocusHost);
    }
    let p: Vec<u32> = Args::split(args).nums(4)?;
    Some(Command::Focus { dev: p[0], sm: p[1], wp: p[2], ln: p[3] })
}

/// `step <dev> <sm> <wp> [count]`
fn parse_step(args: &str) -> Option<Command> {
    let a = Args::split(args);
    let p: Vec<u32> = a.nums(3)?;
    let count = match a.positional.get(3) {
        Some(n) => num(n)?,
        None => 1,
    };
    Some(Command::Step { dev: p[0], sm: p[1], wp: p[2], count })
}

fn parse_info(args: &str) -> Option<Command> {
    let a = Args::split(args);
    let kind = match *a.positional.first()? {
        "devices" => InfoKind::Devices,
        "sms" => InfoKind::Sms(num(a.positional.get(1).copied().unwrap_or("0"))?),
        "warps" => InfoKind::Warps,
        "lanes" => InfoKind::Lanes {
            sm: a.option("sm").and_then(num),
            wp: a.option("wp").and_then(num),
        },
        "kernels" => InfoKind::Kernels,
        "breakpoints" | "break" | "b" => InfoKind::Breakpoints,
        "autostep" => InfoKind::Autostep,
        "focus" => InfoKind::Focus,
        "calls" => InfoKind::Calls(a.positional.get(1).map(|s| s.to_string())),
        _ => return None,
    };
    Some(Command::Info(kind))
}

/// `expect calls <name> <n>`, `expect pc <dev> <sm> <wp> <pc>`,
/// `expect phase <phase>`, `expect kernels <n>`
fn parse_expect(args: &str) -> Option<Command> {
    let a = Args::split(args);
    let rest = Args { positional: a.positional.get(1..)?.to_vec(), options: Vec::new() };
    let expectation = match *a.positional.first()? {
        "calls" => Expectation::Calls {
            name: rest.positional.first()?.to_string(),
            count: num(rest.positional.get(1)?)?,
        },
        "pc" => {
            let p: Vec<u64> = rest.nums(4)?;
            Expectation::Pc {
                dev: u32::try_from(p[0]).ok()?,
                sm: u32::try_from(p[1]).ok()?,
                wp: u32::try_from(p[2]).ok()?,
                pc: p[3],
            }
        }
        "phase" => Expectation::Phase(rest.positional.first()?.to_string()),
        "kernels" => Expectation::Kernels(num(rest.positional.first()?)?),
        _ => return None,
    };
    Some(Command::Expect(expectation))
}
