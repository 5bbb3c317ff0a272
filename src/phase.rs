//! GC-cycle delimitation and lifecycle callbacks.

use crate::config::TimeWindow;
use crate::error::{ProtocolError, TraceError};
use crate::heap::HeapGraph;
use crate::statistics::StatisticsAggregator;
use crate::trace::ParserGcInfo;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Boundary {
    Start,
    End,
}

/// One validated cycle boundary
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PhaseChange {
    pub boundary: Boundary,
    /// Info committed at the previous boundary; `None` before the first
    pub previous: Option<ParserGcInfo>,
    pub next: ParserGcInfo,
    pub failed: bool,
    /// Byte offset of the boundary record
    pub position: u64,
    /// Whether the cycle's timestamp lies in the configured window
    pub in_window: bool,
}

impl PhaseChange {
    pub fn is_start(&self) -> bool {
        self.boundary == Boundary::Start
    }
}

/// What a listener sees at a boundary
pub struct PhaseContext<'a> {
    pub change: &'a PhaseChange,
    pub graph: &'a HeapGraph,
    pub statistics: &'a StatisticsAggregator,
}

/// What a listener sees when the parse is over
pub struct CloseContext<'a> {
    pub graph: &'a HeapGraph,
    pub statistics: &'a StatisticsAggregator,
    /// Offset decoding stopped at
    pub position: u64,
    /// Cycles completed, the synthesized cycle 0 included
    pub cycles: u32,
    /// False when the parse failed or was cancelled
    pub completed: bool,
}

/// Callbacks around each boundary, invoked on the parsing thread in
/// registration order. An error aborts the parse.
pub trait PhaseListener: Send {
    /// Before the new cycle info is committed
    fn phase_changing(&mut self, _ctx: &PhaseContext) -> anyhow::Result<()> {
        Ok(())
    }

    /// After commit; graph and statistics reflect the boundary
    fn phase_changed(&mut self, _ctx: &PhaseContext) -> anyhow::Result<()> {
        Ok(())
    }

    /// Once per parse, after the last event, whether or not it succeeded
    fn close(&mut self, _ctx: &CloseContext) -> anyhow::Result<()> {
        Ok(())
    }
}

pub struct PhaseMachine {
    committed: Option<ParserGcInfo>,
    /// Cycles started and not yet ended, oldest first
    open: Vec<ParserGcInfo>,
    last_start_id: Option<u32>,
    allow_nested: bool,
    window: Option<TimeWindow>,
    listeners: Vec<Box<dyn PhaseListener>>,
}

impl PhaseMachine {
    pub fn new(allow_nested: bool, window: Option<TimeWindow>) -> Self {
        PhaseMachine {
            committed: None,
            open: vec![],
            last_start_id: None,
            allow_nested,
            window,
            listeners: vec![],
        }
    }

    /// Continue from a persisted position
    #[must_use]
    pub fn with_state(mut self, committed: Option<ParserGcInfo>, open: Vec<ParserGcInfo>, last_start_id: Option<u32>) -> Self {
        self.committed = committed;
        self.open = open;
        self.last_start_id = last_start_id;
        self
    }

    pub fn add_listener(&mut self, listener: Box<dyn PhaseListener>) {
        self.listeners.push(listener);
    }

    pub fn committed(&self) -> Option<&ParserGcInfo> {
        self.committed.as_ref()
    }

    pub fn open_cycles(&self) -> &[ParserGcInfo] {
        &self.open
    }

    pub fn last_start_id(&self) -> Option<u32> {
        self.last_start_id
    }

    pub fn is_idle(&self) -> bool {
        self.open.is_empty()
    }

    /// The end boundary a restored machine sits at, so listeners joining a
    /// resumed parse see the committed cycle
    pub fn resumed_at(&self, position: u64) -> Option<PhaseChange> {
        let committed = self.committed.as_ref()?;
        Some(self.change(Boundary::End, committed, position))
    }

    fn change(&self, boundary: Boundary, info: &ParserGcInfo, position: u64) -> PhaseChange {
        PhaseChange {
            boundary,
            previous: self.committed.clone(),
            next: info.clone(),
            failed: info.failed,
            position,
            in_window: self.window.map_or(true, |w| w.contains(info.timestamp)),
        }
    }

    pub fn begin(&self, info: &ParserGcInfo, position: u64) -> Result<PhaseChange, TraceError> {
        if let (Some(open), false) = (self.open.last(), self.allow_nested) {
            return Err(ProtocolError::NestedGcCycle {
                open: open.id,
                new: info.id,
                offset: position,
            }
            .into());
        }
        if let Some(last) = self.last_start_id {
            if info.id <= last {
                return Err(ProtocolError::NonMonotonicGcId {
                    id: info.id,
                    last,
                    offset: position,
                }
                .into());
            }
        }
        Ok(self.change(Boundary::Start, info, position))
    }

    pub fn end(&self, info: &ParserGcInfo, position: u64) -> Result<PhaseChange, TraceError> {
        if !self.open.iter().any(|o| o.id == info.id) {
            return Err(ProtocolError::UnmatchedGcEnd {
                id: info.id,
                offset: position,
            }
            .into());
        }
        Ok(self.change(Boundary::End, info, position))
    }

    pub fn commit(&mut self, change: &PhaseChange) {
        match change.boundary {
            Boundary::Start => {
                self.open.push(change.next.clone());
                self.last_start_id = Some(change.next.id);
            }
            Boundary::End => self.open.retain(|o| o.id != change.next.id),
        }
        self.committed = Some(change.next.clone());
    }

    pub fn notify_changing(&mut self, ctx: &PhaseContext) -> Result<(), TraceError> {
        for listener in &mut self.listeners {
            listener.phase_changing(ctx).map_err(TraceError::Listener)?;
        }
        Ok(())
    }

    pub fn notify_changed(&mut self, ctx: &PhaseContext) -> Result<(), TraceError> {
        for listener in &mut self.listeners {
            listener.phase_changed(ctx).map_err(TraceError::Listener)?;
        }
        Ok(())
    }

    /// Close and drop every listener. All of them are closed even if one
    /// fails; the first error is returned.
    pub fn notify_close(&mut self, ctx: &CloseContext) -> Result<(), TraceError> {
        let mut result = Ok(());
        for mut listener in self.listeners.drain(..) {
            if let Err(e) = listener.close(ctx) {
                if result.is_ok() {
                    result = Err(TraceError::Listener(e));
                } else {
                    warn!("Listener failed to close: {:#}", e);
                }
            }
        }
        result
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::symbols::Symbols;
    use crate::trace::GcKind;
    use std::sync::{Arc, Mutex};

    pub(crate) fn gc(id: u32, timestamp: u64) -> ParserGcInfo {
        ParserGcInfo {
            id,
            kind: GcKind::Minor,
            cause: "Allocation Failure".to_string(),
            concurrent: false,
            failed: false,
            timestamp,
        }
    }

    /// Records every callback as `(name, boundary, id, in_window)`
    pub(crate) struct Recorder {
        pub(crate) name: &'static str,
        pub(crate) log: Arc<Mutex<Vec<(String, Boundary, u32, bool)>>>,
        pub(crate) fail_on: Option<u32>,
    }

    impl PhaseListener for Recorder {
        fn phase_changing(&mut self, ctx: &PhaseContext) -> anyhow::Result<()> {
            self.log.lock().unwrap().push((
                format!("{}:changing", self.name),
                ctx.change.boundary,
                ctx.change.next.id,
                ctx.change.in_window,
            ));
            if self.fail_on == Some(ctx.change.next.id) {
                anyhow::bail!("{} refuses cycle {}", self.name, ctx.change.next.id);
            }
            Ok(())
        }

        fn phase_changed(&mut self, ctx: &PhaseContext) -> anyhow::Result<()> {
            self.log.lock().unwrap().push((
                format!("{}:changed", self.name),
                ctx.change.boundary,
                ctx.change.next.id,
                ctx.change.in_window,
            ));
            Ok(())
        }

        /// Logged as an end boundary carrying the cycle count
        fn close(&mut self, ctx: &CloseContext) -> anyhow::Result<()> {
            self.log.lock().unwrap().push((
                format!("{}:close", self.name),
                Boundary::End,
                ctx.cycles,
                ctx.completed,
            ));
            if self.fail_on == Some(u32::MAX) {
                anyhow::bail!("{} cannot flush", self.name);
            }
            Ok(())
        }
    }

    fn step(m: &mut PhaseMachine, change: PhaseChange) -> Result<(), TraceError> {
        let graph = HeapGraph::new();
        let statistics = StatisticsAggregator::new(Arc::new(Symbols::new(8)), None, 256);
        let ctx = PhaseContext {
            change: &change,
            graph: &graph,
            statistics: &statistics,
        };
        m.notify_changing(&ctx)?;
        m.commit(&change);
        m.notify_changed(&ctx)
    }

    #[test]
    fn test_cycle_sequence() {
        let mut m = PhaseMachine::new(false, None);
        let start = m.begin(&gc(1, 10), 100).unwrap();
        assert!(start.previous.is_none());
        step(&mut m, start).unwrap();
        assert!(!m.is_idle());
        let end = m.end(&gc(1, 20), 200).unwrap();
        assert_eq!(end.previous.as_ref().map(|p| p.id), Some(1));
        step(&mut m, end).unwrap();
        assert!(m.is_idle());
        assert_eq!(m.committed().map(|c| c.timestamp), Some(20));
    }

    #[test]
    fn test_nested_cycle_rejected() {
        let mut m = PhaseMachine::new(false, None);
        let start = m.begin(&gc(1, 0), 0).unwrap();
        step(&mut m, start).unwrap();
        assert!(matches!(
            m.begin(&gc(2, 0), 50),
            Err(TraceError::Protocol(ProtocolError::NestedGcCycle { open: 1, new: 2, offset: 50 }))
        ));
    }

    #[test]
    fn test_nested_cycles_allowed() {
        let mut m = PhaseMachine::new(true, None);
        for id in [1, 2] {
            let start = m.begin(&gc(id, 0), 0).unwrap();
            step(&mut m, start).unwrap();
        }
        assert_eq!(m.open_cycles().len(), 2);
        let end = m.end(&gc(1, 0), 0).unwrap();
        step(&mut m, end).unwrap();
        assert_eq!(m.open_cycles()[0].id, 2);
    }

    #[test]
    fn test_ids_must_increase() {
        let mut m = PhaseMachine::new(false, None);
        let start = m.begin(&gc(5, 0), 0).unwrap();
        step(&mut m, start).unwrap();
        let end = m.end(&gc(5, 0), 0).unwrap();
        step(&mut m, end).unwrap();
        assert!(matches!(
            m.begin(&gc(5, 0), 9),
            Err(TraceError::Protocol(ProtocolError::NonMonotonicGcId { id: 5, last: 5, offset: 9 }))
        ));
    }

    #[test]
    fn test_unmatched_end() {
        let m = PhaseMachine::new(false, None);
        assert!(matches!(
            m.end(&gc(3, 0), 7),
            Err(TraceError::Protocol(ProtocolError::UnmatchedGcEnd { id: 3, offset: 7 }))
        ));
    }

    #[test]
    fn test_listener_order_and_window() {
        let log = Arc::new(Mutex::new(vec![]));
        let mut m = PhaseMachine::new(false, Some(TimeWindow::new(100, 200)));
        for name in ["a", "b"] {
            m.add_listener(Box::new(Recorder {
                name,
                log: log.clone(),
                fail_on: None,
            }));
        }
        let start = m.begin(&gc(1, 150), 0).unwrap();
        step(&mut m, start).unwrap();
        let end = m.end(&gc(1, 250), 0).unwrap();
        step(&mut m, end).unwrap();
        let log = log.lock().unwrap();
        let names: Vec<&str> = log.iter().map(|e| e.0.as_str()).collect();
        assert_eq!(
            names,
            vec!["a:changing", "b:changing", "a:changed", "b:changed", "a:changing", "b:changing", "a:changed", "b:changed"]
        );
        assert!(log[0].3);
        assert!(!log[4].3);
    }

    #[test]
    fn test_listener_error_aborts() {
        let log = Arc::new(Mutex::new(vec![]));
        let mut m = PhaseMachine::new(false, None);
        m.add_listener(Box::new(Recorder {
            name: "picky",
            log: log.clone(),
            fail_on: Some(1),
        }));
        m.add_listener(Box::new(Recorder {
            name: "never",
            log: log.clone(),
            fail_on: None,
        }));
        let start = m.begin(&gc(1, 0), 0).unwrap();
        match step(&mut m, start) {
            Err(TraceError::Listener(e)) => assert!(e.to_string().contains("refuses cycle 1")),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(log.lock().unwrap().len(), 1);
        // nothing was committed
        assert!(m.is_idle());
    }

    #[test]
    fn test_close_reaches_every_listener() {
        let log = Arc::new(Mutex::new(vec![]));
        let mut m = PhaseMachine::new(false, None);
        for (name, fail_on) in [("a", Some(u32::MAX)), ("b", None)] {
            m.add_listener(Box::new(Recorder {
                name,
                log: log.clone(),
                fail_on,
            }));
        }
        let graph = HeapGraph::new();
        let statistics = StatisticsAggregator::new(Arc::new(Symbols::new(8)), None, 256);
        let ctx = CloseContext {
            graph: &graph,
            statistics: &statistics,
            position: 42,
            cycles: 3,
            completed: true,
        };
        assert!(matches!(m.notify_close(&ctx), Err(TraceError::Listener(_))));
        let names: Vec<String> = log.lock().unwrap().iter().map(|e| e.0.clone()).collect();
        assert_eq!(names, vec!["a:close", "b:close"]);
        // listeners are gone once closed
        m.notify_close(&ctx).unwrap();
        assert_eq!(log.lock().unwrap().len(), 2);
    }

    #[test]
    fn test_resumed_at_committed_end() {
        let m = PhaseMachine::new(false, Some(TimeWindow::new(0, 100))).with_state(Some(gc(4, 50)), vec![], Some(4));
        let change = m.resumed_at(900).unwrap();
        assert_eq!(change.boundary, Boundary::End);
        assert_eq!(change.next.id, 4);
        assert_eq!(change.position, 900);
        assert!(change.in_window);
        assert!(PhaseMachine::new(false, None).resumed_at(0).is_none());
    }
}
