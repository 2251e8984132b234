//! Typed observer lists for homing notifications.
//!
//! Observers are registered on the session and handed to every move it
//! creates. Each payload is a concrete enum; an observer may veto by
//! returning an error, which is merged into the move's own error policy.

use plumb_common::axis::{ActuatorId, AxisSet};
use plumb_common::error::HomingResult;
use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Rc;

type Observer<E> = Rc<RefCell<dyn FnMut(&E) -> HomingResult<()>>>;

/// Ordered list of observers for one event type.
pub struct ObserverList<E> {
    observers: Vec<Observer<E>>,
}

impl<E> Default for ObserverList<E> {
    fn default() -> Self {
        Self {
            observers: Vec::new(),
        }
    }
}

impl<E> Clone for ObserverList<E> {
    fn clone(&self) -> Self {
        Self {
            observers: self.observers.clone(),
        }
    }
}

impl<E> ObserverList<E> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&mut self, observer: F)
    where
        F: FnMut(&E) -> HomingResult<()> + 'static,
    {
        self.observers.push(Rc::new(RefCell::new(observer)));
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.observers.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.observers.is_empty()
    }

    /// Notify every observer; all run even if one fails. The first error
    /// is returned.
    pub fn notify(&self, event: &E) -> HomingResult<()> {
        let mut first = Ok(());
        for observer in &self.observers {
            let mut f = observer.borrow_mut();
            let result = (&mut *f)(event);
            if first.is_ok() {
                first = result;
            }
        }
        first
    }
}

/// Notification published by a single homing move.
#[derive(Debug, Clone, PartialEq)]
pub enum MoveEvent {
    Begin {
        sensors: Vec<String>,
    },
    End {
        /// Sensors that reported a trigger, with their trigger time.
        trigger_times: BTreeMap<String, f64>,
        /// Sensors that completed without triggering.
        untriggered: Vec<String>,
        /// The vertical axis ran its full travel without a genuine trigger.
        full_travel_no_trigger: bool,
    },
}

/// Notification published around one axis-group home.
#[derive(Debug)]
pub enum RailsEvent {
    Begin {
        axes: AxisSet,
    },
    End {
        axes: AxisSet,
        /// Step counter of each actuator at its final trigger.
        trigger_positions: BTreeMap<ActuatorId, i64>,
        adjustments: RefCell<BTreeMap<ActuatorId, f64>>,
    },
}

impl RailsEvent {
    /// Register a per-actuator adjustment in steps. Ignored on `Begin`.
    pub fn set_adjustment(&self, actuator: &str, steps: f64) {
        if let Self::End { adjustments, .. } = self {
            adjustments.borrow_mut().insert(actuator.to_string(), steps);
        }
    }
}
