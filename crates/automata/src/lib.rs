//! A byte-stream automaton kernel.
//!
//! A [`Machine`] is an immutable network of [`State`]s built once and run
//! many times. A [`Runner`] walks the network over a [`Source`] of bytes,
//! depositing parsed values into a [`dict::Dict`] at paths derived from
//! state contexts, and suspends cleanly whenever the source runs dry;
//! chaining more bytes and stepping again resumes exactly where it left
//! off. Machines compose: a state may delegate to a sub-machine, which
//! inherits the parent's source and dictionary under a concatenated
//! context path.

use dict::Dict;
use std::collections::BTreeMap;
use std::sync::Arc;

pub mod scan;
mod source;

pub use scan::{Format, Need, Number, Octets, Repeat, Scan, Sstring, Words};
pub use source::Source;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The source is dry, nothing was chained, and the machine was
    /// stepped again anyway: a driver bug, not a parse failure.
    #[error("no progress at state {state:?}: source empty and nothing chained")]
    Stuck { state: String },

    #[error("parse failed at state {state:?}: {reason}")]
    Parse { state: String, reason: String },

    #[error(transparent)]
    Dict(#[from] dict::Error),
}

/// Outcome of one [`Runner::step`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Progress {
    /// The machine advanced: consumed input, took a transition, or both.
    Transitioned,
    /// Out of input mid-parse; chain more bytes and step again.
    Suspended,
    /// The machine accepted.
    Terminal,
    /// The machine cannot accept this input; see [`Runner::error`].
    Failed,
}

/// What a state does with the input when entered.
#[derive(Debug)]
pub enum Kind {
    /// Consumes nothing and stores nothing: a pure branch point.
    Noop,
    /// Consumes one symbol, stores nothing.
    Drop,
    /// ASCII decimal digits up to (not including) a non-digit sentinel;
    /// stores the integer at the context path.
    IntegerBytes,
    /// A byte-run collector; see [`scan`].
    Scan(Arc<dyn Scan>),
    /// Runs a sub-machine to acceptance under the concatenated context.
    Sub(Arc<Machine>),
}

/// Branch on an already-parsed value instead of an input symbol: the path
/// (joined to the running context) is read from the dictionary and
/// matched against the cases.
#[derive(Debug)]
pub struct Select {
    pub path: String,
    pub cases: Vec<(i64, StateId)>,
    pub default: Option<StateId>,
}

pub type StateId = usize;

/// A node of the machine. The transition map is keyed by input symbol,
/// with an optional epsilon successor taken when no symbol matches; it is
/// fixed at build time.
#[derive(Debug)]
pub struct State {
    pub name: String,
    pub kind: Kind,
    /// Path component prefixed to everything this state (and any
    /// sub-machine) writes.
    pub context: Option<String>,
    pub terminal: bool,
    edges: BTreeMap<u8, StateId>,
    epsilon: Option<StateId>,
    select: Option<Select>,
}

impl State {
    pub fn new(name: impl Into<String>, kind: Kind) -> State {
        State {
            name: name.into(),
            kind,
            context: None,
            terminal: false,
            edges: BTreeMap::new(),
            epsilon: None,
            select: None,
        }
    }

    pub fn context(mut self, ctx: impl Into<String>) -> State {
        self.context = Some(ctx.into());
        self
    }

    pub fn terminal(mut self) -> State {
        self.terminal = true;
        self
    }
}

/// An immutable state network with a designated initial state. A greedy
/// machine keeps looping while transitions remain possible from terminal
/// states; a non-greedy machine accepts at the first terminal reach.
#[derive(Debug)]
pub struct Machine {
    pub name: String,
    states: Vec<State>,
    initial: StateId,
    greedy: bool,
}

impl Machine {
    pub fn runner(self: &Arc<Self>) -> Runner {
        Runner::new(self.clone())
    }

    fn state(&self, id: StateId) -> &State {
        &self.states[id]
    }
}

/// Construction-time view of a machine: states are added, wired with
/// symbol/epsilon/select transitions, then frozen by [`Builder::build`].
pub struct Builder {
    name: String,
    states: Vec<State>,
    greedy: bool,
}

impl Builder {
    pub fn new(name: impl Into<String>) -> Builder {
        Builder {
            name: name.into(),
            states: Vec::new(),
            greedy: false,
        }
    }

    pub fn greedy(mut self) -> Builder {
        self.greedy = true;
        self
    }

    pub fn add(&mut self, state: State) -> StateId {
        self.states.push(state);
        self.states.len() - 1
    }

    /// Add a linear run of states, each epsilon-chained to the next.
    pub fn seq(&mut self, states: Vec<State>) -> (StateId, StateId) {
        assert!(!states.is_empty(), "seq requires at least one state");
        let first = self.states.len();
        for state in states {
            let id = self.add(state);
            if id > first {
                self.states[id - 1].epsilon = Some(id);
            }
        }
        (first, self.states.len() - 1)
    }

    pub fn edge(&mut self, from: StateId, symbol: u8, to: StateId) {
        let prior = self.states[from].edges.insert(symbol, to);
        assert!(prior.is_none(), "duplicate edge on symbol {symbol:#04x}");
    }

    pub fn eps(&mut self, from: StateId, to: StateId) {
        assert!(self.states[from].epsilon.is_none(), "duplicate epsilon");
        self.states[from].epsilon = Some(to);
    }

    pub fn select(&mut self, from: StateId, select: Select) {
        self.states[from].select = Some(select);
    }

    pub fn build(self) -> Arc<Machine> {
        for state in &self.states {
            for (_, to) in &state.edges {
                assert!(*to < self.states.len(), "edge to unknown state");
            }
        }
        Arc::new(Machine {
            name: self.name,
            states: self.states,
            initial: 0,
            greedy: self.greedy,
        })
    }
}

/// One activation record: a machine, its current state, the context path
/// of the activation, and any partial byte run of the current state.
#[derive(Debug)]
struct Frame {
    machine: Arc<Machine>,
    state: StateId,
    path: String,
    got: Vec<u8>,
    processed: bool,
}

impl Frame {
    fn new(machine: Arc<Machine>, path: String) -> Frame {
        Frame {
            state: machine.initial,
            machine,
            path,
            got: Vec::new(),
            processed: false,
        }
    }
}

/// A resumable run of a machine over a source.
#[derive(Debug)]
pub struct Runner {
    frames: Vec<Frame>,
    root_path: String,
    finished: Option<Progress>,
    error: Option<Error>,
    /// Consumption count at the last suspension, for stuck detection.
    suspended_at: Option<usize>,
    /// Transitions taken since input was last consumed, bounding
    /// epsilon/select cycles.
    idle_hops: usize,
}

impl Runner {
    pub fn new(machine: Arc<Machine>) -> Runner {
        Runner::with_path(machine, "")
    }

    /// Run with every context path prefixed by `path`.
    pub fn with_path(machine: Arc<Machine>, path: &str) -> Runner {
        Runner {
            frames: vec![Frame::new(machine, path.to_string())],
            root_path: path.to_string(),
            finished: None,
            error: None,
            suspended_at: None,
            idle_hops: 0,
        }
    }

    /// The parse failure behind a [`Progress::Failed`], if any.
    pub fn error(&self) -> Option<&Error> {
        self.error.as_ref()
    }

    /// Name of the current state, innermost activation first.
    pub fn at(&self) -> String {
        self.frames
            .iter()
            .rev()
            .map(|f| {
                format!("{}/{}", f.machine.name, f.machine.state(f.state).name)
            })
            .collect::<Vec<_>>()
            .join(" < ")
    }

    /// Step until the machine accepts, fails, or suspends for more input.
    pub fn run(&mut self, source: &mut Source, data: &mut Dict) -> Result<Progress, Error> {
        loop {
            match self.step(source, data)? {
                Progress::Transitioned => continue,
                done => return Ok(done),
            }
        }
    }

    /// Advance by (at most) one state process and one transition.
    pub fn step(&mut self, source: &mut Source, data: &mut Dict) -> Result<Progress, Error> {
        if let Some(done) = self.finished {
            return Ok(done);
        }

        // Stuck detection: suspending twice at the same consumption count
        // with nothing chained in between is a driver error.
        let progress = self.step_inner(source, data)?;
        match progress {
            Progress::Suspended => {
                if self.suspended_at == Some(source.consumed()) && source.is_empty() {
                    return Err(Error::Stuck { state: self.at() });
                }
                self.suspended_at = Some(source.consumed());
            }
            Progress::Transitioned => {}
            done => self.finished = Some(done),
        }
        Ok(progress)
    }

    fn step_inner(&mut self, source: &mut Source, data: &mut Dict) -> Result<Progress, Error> {
        let consumed_before = source.consumed();

        // Clone the activation's machine handle so that state inspection
        // borrows a local, leaving `self` free for goto/accept/fail.
        let (machine, state_id, path, processed) = {
            let f = self.frames.last().expect("root frame always present");
            (f.machine.clone(), f.state, f.path.clone(), f.processed)
        };
        let state = machine.state(state_id);
        let ctx = join_opt(&path, state.context.as_deref());

        // 1. Complete the state's process, consuming zero or more symbols.
        if !processed {
            match &state.kind {
                Kind::Noop => {}
                Kind::Drop => match source.take() {
                    Some(_) => {}
                    None if source.is_closed() => {
                        return self.fail("end of input".to_string());
                    }
                    None => return Ok(Progress::Suspended),
                },
                Kind::IntegerBytes => loop {
                    match source.peek() {
                        Some(d) if d.is_ascii_digit() => {
                            self.got().push(d);
                            source.take();
                        }
                        None if !source.is_closed() => return Ok(Progress::Suspended),
                        _ => {
                            // A non-digit sentinel (left unconsumed), or EOF.
                            if self.got().is_empty() {
                                return self.fail("expected decimal digits".to_string());
                            }
                            let text = String::from_utf8(self.got().clone())
                                .expect("digits are ASCII");
                            let Ok(n) = text.parse::<i64>() else {
                                return self.fail(format!("integer overflow in {text:?}"));
                            };
                            data.set(&ctx, n)?;
                            break;
                        }
                    }
                },
                Kind::Scan(scan) => loop {
                    match scan.need(self.got(), data, &ctx)? {
                        Need::More(0) => {
                            if let Err(err) = scan.decode(self.got(), data, &ctx) {
                                return self.fail(err.to_string());
                            }
                            break;
                        }
                        Need::More(n) => {
                            if !pull(source, self.got(), n) {
                                if source.is_closed() {
                                    return self.fail(format!(
                                        "{n} more bytes needed at end of input"
                                    ));
                                }
                                return Ok(Progress::Suspended);
                            }
                        }
                        Need::MoreOrDone(n) => {
                            if source.is_empty() {
                                if source.is_closed() {
                                    if let Err(err) = scan.decode(self.got(), data, &ctx) {
                                        return self.fail(err.to_string());
                                    }
                                    break;
                                }
                                return Ok(Progress::Suspended);
                            }
                            pull(source, self.got(), n.max(1));
                        }
                    }
                },
                Kind::Sub(sub) => {
                    let sub = sub.clone();
                    let frame = self.frames.last_mut().expect("root frame always present");
                    frame.processed = true;
                    self.frames.push(Frame::new(sub, ctx));
                    return Ok(Progress::Transitioned);
                }
            }
            let frame = self.frames.last_mut().expect("root frame always present");
            frame.processed = true;
        }

        // 2. A terminal state of a non-greedy machine accepts immediately.
        if state.terminal && !machine.greedy {
            return Ok(self.accept());
        }

        // 3. Value-keyed branches decide without looking at input.
        if let Some(select) = &state.select {
            let full = join(&path, &select.path);
            let v = data.get_int(&full)?;
            let to = select
                .cases
                .iter()
                .find(|(case, _)| *case == v)
                .map(|(_, to)| *to)
                .or(select.default);
            return match to {
                Some(to) => self.goto(to, consumed_before, source),
                None => self.fail(format!("no case for {full} == {v:#x}")),
            };
        }

        // 4. Symbol-keyed transitions, then epsilon, then halt/suspend.
        match source.peek() {
            Some(symbol) => {
                if let Some(&to) = state.edges.get(&symbol) {
                    source.take();
                    return self.goto(to, consumed_before, source);
                }
                if let Some(to) = state.epsilon {
                    return self.goto(to, consumed_before, source);
                }
                if state.terminal {
                    // Greedy machine: input refused at a terminal state.
                    return Ok(self.accept());
                }
                self.fail(format!("no transition on symbol {symbol:#04x}"))
            }
            None if source.is_closed() => {
                if let Some(to) = state.epsilon {
                    return self.goto(to, consumed_before, source);
                }
                if state.terminal {
                    return Ok(self.accept());
                }
                self.fail("end of input".to_string())
            }
            None => {
                // No symbol yet. A state with only an epsilon needs none.
                if state.edges.is_empty() && !state.terminal {
                    if let Some(to) = state.epsilon {
                        return self.goto(to, consumed_before, source);
                    }
                }
                Ok(Progress::Suspended)
            }
        }
    }

    /// The current activation's partial byte run.
    fn got(&mut self) -> &mut Vec<u8> {
        &mut self.frames.last_mut().expect("root frame always present").got
    }

    fn goto(
        &mut self,
        to: StateId,
        consumed_before: usize,
        source: &Source,
    ) -> Result<Progress, Error> {
        if source.consumed() == consumed_before {
            self.idle_hops += 1;
            let frame = self.frames.last().expect("root frame always present");
            if self.idle_hops > frame.machine.states.len() + 1 {
                return Err(Error::Stuck { state: self.at() });
            }
        } else {
            self.idle_hops = 0;
        }
        let frame = self.frames.last_mut().expect("root frame always present");
        frame.state = to;
        frame.got.clear();
        frame.processed = false;
        Ok(Progress::Transitioned)
    }

    /// The innermost machine accepted: pop its activation, or finish.
    fn accept(&mut self) -> Progress {
        if self.frames.len() == 1 {
            return Progress::Terminal;
        }
        self.frames.pop();
        Progress::Transitioned
    }

    fn fail(&mut self, reason: String) -> Result<Progress, Error> {
        self.error = Some(Error::Parse {
            state: self.at(),
            reason,
        });
        tracing::debug!(state = %self.at(), error = ?self.error, "parse failed");
        Ok(Progress::Failed)
    }

    /// Root context path this runner writes under.
    pub fn path(&self) -> &str {
        &self.root_path
    }
}

/// Pull up to `n` bytes from the source into `got`; true if all arrived.
fn pull(source: &mut Source, got: &mut Vec<u8>, n: usize) -> bool {
    for _ in 0..n {
        match source.take() {
            Some(b) => got.push(b),
            None => return false,
        }
    }
    true
}

/// Join two context path components, either possibly empty. A suffix
/// beginning with `.` is a back-reference (`..length` names a sibling of
/// the prefix) and concatenates without a separator.
pub fn join(prefix: &str, suffix: &str) -> String {
    match (prefix.is_empty(), suffix.is_empty()) {
        (true, _) => suffix.to_string(),
        (_, true) => prefix.to_string(),
        _ if suffix.starts_with('.') => format!("{prefix}{suffix}"),
        _ => format!("{prefix}.{suffix}"),
    }
}

fn join_opt(prefix: &str, suffix: Option<&str>) -> String {
    join(prefix, suffix.unwrap_or(""))
}

#[cfg(test)]
mod test {
    use super::*;
    use pretty_assertions::assert_eq;

    fn octets_machine(name: &str, repeat: usize) -> Arc<Machine> {
        let mut b = Builder::new("octets");
        b.add(
            State::new("data", Kind::Scan(Arc::new(Octets { repeat: Repeat::Count(repeat) })))
                .context(name)
                .terminal(),
        );
        b.build()
    }

    #[test]
    fn test_octets() {
        // Scan 5 from a sufficient source.
        let machine = octets_machine("five", 5);
        let mut source = Source::new();
        source.chain(&b"abc123"[..]);
        let mut data = Dict::new();
        let mut run = Runner::with_path(machine, "octets");

        assert_eq!(run.run(&mut source, &mut data).unwrap(), Progress::Terminal);
        assert_eq!(source.peek(), Some(b'3'));
        assert_eq!(data.get_bytes("octets.five.input").unwrap(), b"abc12");
    }

    #[test]
    fn test_octets_singly() {
        // Provide the source one byte at a time, suspending in between.
        let machine = octets_machine("singly", 5);
        let mut origin = Source::new();
        origin.chain(&b"abc123"[..]);
        let mut source = Source::new();
        let mut data = Dict::new();
        let mut run = Runner::with_path(machine, "octets");

        let mut suspensions = 0;
        loop {
            match run.run(&mut source, &mut data).unwrap() {
                Progress::Terminal => break,
                Progress::Suspended => {
                    suspensions += 1;
                    source.chain(vec![origin.take().unwrap()]);
                }
                other => panic!("unexpected progress {other:?}"),
            }
        }
        assert_eq!(suspensions, 5);
        assert_eq!(origin.peek(), Some(b'3'));
        assert_eq!(data.get_bytes("octets.singly.input").unwrap(), b"abc12");
    }

    #[test]
    fn test_octets_deficient() {
        // A closed source with too little input is a parse failure; a
        // still-open one is a suspension, and stepping again without
        // chaining is the driver's error.
        let machine = octets_machine("less", 5);
        let mut source = Source::new();
        source.chain(&b"3"[..]);
        source.close();
        let mut data = Dict::new();
        let mut run = machine.runner();
        assert_eq!(run.run(&mut source, &mut data).unwrap(), Progress::Failed);
        assert!(run.error().is_some());

        let machine = octets_machine("less", 5);
        let mut source = Source::new();
        source.chain(&b"3"[..]);
        let mut data = Dict::new();
        let mut run = machine.runner();
        assert_eq!(run.run(&mut source, &mut data).unwrap(), Progress::Suspended);
        assert!(matches!(
            run.run(&mut source, &mut data),
            Err(Error::Stuck { .. })
        ));
    }

    #[test]
    fn test_octets_zero() {
        let machine = octets_machine("none", 0);
        let mut source = Source::new();
        source.chain(&b"abc123"[..]);
        let mut data = Dict::new();
        let mut run = Runner::with_path(machine, "octets");
        assert_eq!(run.run(&mut source, &mut data).unwrap(), Progress::Terminal);
        assert_eq!(source.peek(), Some(b'a'));
        assert_eq!(data.get_bytes("octets.none.input").unwrap(), b"");
    }

    #[test]
    fn test_number_chain() {
        // A linear chain of fixed-layout fields, as a frame header is.
        let mut b = Builder::new("header");
        b.seq(vec![
            State::new("command", Kind::Scan(Arc::new(Number { format: Format::U16 })))
                .context("command"),
            State::new("length", Kind::Scan(Arc::new(Number { format: Format::U16 })))
                .context("length"),
            State::new("payload", Kind::Scan(Arc::new(Octets {
                repeat: Repeat::Path("..length".to_string()),
            })))
            .context("payload")
            .terminal(),
        ]);
        let machine = b.build();

        let mut source = Source::new();
        source.chain(&[0x65, 0x00, 0x03, 0x00, b'x', b'y', b'z', b'!'][..]);
        let mut data = Dict::new();
        let mut run = Runner::with_path(machine, "enip");
        assert_eq!(run.run(&mut source, &mut data).unwrap(), Progress::Terminal);
        assert_eq!(data.get_int("enip.command").unwrap(), 0x65);
        assert_eq!(data.get_int("enip.length").unwrap(), 3);
        assert_eq!(data.get_bytes("enip.payload.input").unwrap(), b"xyz");
        assert_eq!(source.peek(), Some(b'!'));
    }

    #[test]
    fn test_sub_machine() {
        // A sub-machine inherits the source and writes under the parent's
        // concatenated context.
        let inner = octets_machine("word", 2);
        let mut b = Builder::new("outer");
        b.seq(vec![
            State::new("first", Kind::Sub(inner.clone())).context("first"),
            State::new("second", Kind::Sub(inner)).context("second").terminal(),
        ]);
        let machine = b.build();

        let mut source = Source::new();
        source.chain(&b"abcd"[..]);
        let mut data = Dict::new();
        let mut run = machine.runner();
        assert_eq!(run.run(&mut source, &mut data).unwrap(), Progress::Terminal);
        assert_eq!(data.get_bytes("first.word.input").unwrap(), b"ab");
        assert_eq!(data.get_bytes("second.word.input").unwrap(), b"cd");
    }

    #[test]
    fn test_select_branch() {
        // Branch on a previously-parsed value.
        let mut b = Builder::new("cmd");
        let head = b.add(
            State::new("code", Kind::Scan(Arc::new(Number { format: Format::U8 })))
                .context("code"),
        );
        let a = b.add(
            State::new("a", Kind::Scan(Arc::new(Octets { repeat: Repeat::Count(1) })))
                .context("a")
                .terminal(),
        );
        let d = b.add(
            State::new("rest", Kind::Scan(Arc::new(Octets { repeat: Repeat::Count(2) })))
                .context("rest")
                .terminal(),
        );
        b.select(
            head,
            Select {
                path: "code".to_string(),
                cases: vec![(0x01, a)],
                default: Some(d),
            },
        );
        let machine = b.build();

        let mut source = Source::new();
        source.chain(&[0x01, 0xaa][..]);
        let mut data = Dict::new();
        let mut run = machine.runner();
        assert_eq!(run.run(&mut source, &mut data).unwrap(), Progress::Terminal);
        assert_eq!(data.get_bytes("a.input").unwrap(), [0xaa]);

        let mut source = Source::new();
        source.chain(&[0x02, 0xbb, 0xcc][..]);
        let mut data = Dict::new();
        let mut run = machine.runner();
        assert_eq!(run.run(&mut source, &mut data).unwrap(), Progress::Terminal);
        assert_eq!(data.get_bytes("rest.input").unwrap(), [0xbb, 0xcc]);
    }

    #[test]
    fn test_symbol_edges() {
        // Symbol-keyed transitions consume the deciding symbol.
        let mut b = Builder::new("svc");
        let head = b.add(State::new("service", Kind::Noop));
        let x = b.add(
            State::new("x", Kind::Scan(Arc::new(Number { format: Format::U8 })))
                .context("x")
                .terminal(),
        );
        let y = b.add(
            State::new("y", Kind::Scan(Arc::new(Number { format: Format::U16 })))
                .context("y")
                .terminal(),
        );
        b.edge(head, 0x4c, x);
        b.edge(head, 0x4d, y);
        let machine = b.build();

        let mut source = Source::new();
        source.chain(&[0x4d, 0x22, 0x11][..]);
        let mut data = Dict::new();
        let mut run = machine.runner();
        assert_eq!(run.run(&mut source, &mut data).unwrap(), Progress::Terminal);
        assert_eq!(data.get_int("y").unwrap(), 0x1122);

        // An unmatched symbol with no epsilon fails.
        let mut source = Source::new();
        source.chain(&[0x99][..]);
        let mut data = Dict::new();
        let mut run = machine.runner();
        assert_eq!(run.run(&mut source, &mut data).unwrap(), Progress::Failed);
    }

    #[test]
    fn test_integer_bytes() {
        let mut b = Builder::new("int");
        b.add(State::new("size", Kind::IntegerBytes).context("size").terminal());
        let machine = b.build();

        let mut source = Source::new();
        source.chain(&b"1234:"[..]);
        let mut data = Dict::new();
        let mut run = machine.runner();
        assert_eq!(run.run(&mut source, &mut data).unwrap(), Progress::Terminal);
        assert_eq!(data.get_int("size").unwrap(), 1234);
        assert_eq!(source.peek(), Some(b':'));
    }
}
