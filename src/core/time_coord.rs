//! Time coordination
//!
//! Pure grant arithmetic, kept apart from the router so it can be tested
//! without queues. A federate blocked at effective request `t` cannot emit
//! anything earlier than `t + look_ahead`; the minimum of that bound over
//! the dependency closure is the federation floor, and a request resolves
//! to `min(t, floor)` once the floor exists.

use std::collections::HashMap;

use crate::ids::FederateId;
use crate::message::{FLAG_CONVERGED, FLAG_EXEC, FLAG_ITERATIVE};
use crate::time::Time;

use super::federate::FederateState;

/// The floor contribution of a set of federates, with the round flags the
/// tree protocol carries alongside it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Floor {
    pub time: Time,
    pub flags: u32,
}

impl Floor {
    pub fn converged(&self) -> bool {
        self.flags & FLAG_CONVERGED != 0
    }

    pub fn exec(&self) -> bool {
        self.flags & FLAG_EXEC != 0
    }
}

/// Compute the local floor once every non-terminal federate is blocked.
///
/// Returns `None` while any live federate is still running: no proof
/// exists that it will not emit earlier traffic.
pub fn local_floor(feds: &HashMap<FederateId, FederateState>) -> Option<Floor> {
    let mut time = Time::MAX;
    let mut flags = FLAG_CONVERGED;
    let mut blocked = 0usize;

    for fed in feds.values() {
        if fed.phase.is_terminal() {
            continue;
        }
        let Some(pending) = fed.pending.as_ref() else {
            return None;
        };
        blocked += 1;
        time = time.min(pending.time + fed.look_ahead);
        if pending.iterative {
            flags |= FLAG_ITERATIVE;
        }
        if pending.exec {
            flags |= FLAG_EXEC;
        }
        if !pending.converged {
            flags &= !FLAG_CONVERGED;
        }
    }

    if blocked == 0 {
        return None;
    }
    Some(Floor { time, flags })
}

/// Decide the grant for one blocked federate against a floor.
///
/// The grant is `min(t_eff, floor)`; it is issued when it either advances
/// the federate's clock or satisfies the request exactly (the iterative
/// same-time case). Grants never regress below the already-granted time.
pub fn grant_for(t_eff: Time, granted: Time, floor: Time) -> Option<Time> {
    let grant = t_eff.min(floor);
    if grant > granted || grant == t_eff {
        Some(grant.max(granted))
    } else {
        None
    }
}

/// Floor over an explicit dependency list, for federates that wait on a
/// subset of the federation. A running dependency contributes its granted
/// time plus look-ahead; a blocked one its effective request plus
/// look-ahead.
pub fn dependency_floor<'a>(deps: impl Iterator<Item = &'a FederateState>) -> Time {
    let mut floor = Time::MAX;
    for dep in deps {
        if dep.phase.is_terminal() {
            continue;
        }
        let basis = match dep.pending.as_ref() {
            Some(pending) => pending.time,
            None => dep.granted,
        };
        floor = floor.min(basis + dep.look_ahead);
    }
    floor
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::federate::{FederateInfo, FederatePhase, PendingReply, PendingRequest};
    use tokio::sync::oneshot;

    fn blocked_fed(name: &str, t_eff: Time, look_ahead: Time, converged: bool) -> FederateState {
        let mut fed = FederateState::new(
            name,
            &FederateInfo {
                look_ahead,
                ..FederateInfo::default()
            },
        );
        fed.phase = FederatePhase::Executing;
        let (tx, _rx) = oneshot::channel();
        fed.pending = Some(PendingRequest {
            time: t_eff,
            iterative: false,
            exec: false,
            converged,
            reply: PendingReply::Time(tx),
        });
        fed
    }

    #[test]
    fn test_no_floor_while_a_federate_runs() {
        let mut feds = HashMap::new();
        feds.insert(FederateId::new(0), blocked_fed("a", Time::from_ns(5), Time::EPSILON, true));
        let mut running = FederateState::new("b", &FederateInfo::default());
        running.phase = FederatePhase::Executing;
        feds.insert(FederateId::new(1), running);

        assert_eq!(local_floor(&feds), None);
    }

    #[test]
    fn test_floor_is_min_output_bound() {
        let mut feds = HashMap::new();
        feds.insert(FederateId::new(0), blocked_fed("a", Time::from_ns(5), Time::EPSILON, true));
        feds.insert(FederateId::new(1), blocked_fed("b", Time::from_ns(3), Time::from_ns(2), true));

        let floor = local_floor(&feds).unwrap();
        assert_eq!(floor.time, Time::from_ns(5));
        assert!(floor.converged());
    }

    #[test]
    fn test_terminal_federates_do_not_gate() {
        let mut feds = HashMap::new();
        feds.insert(FederateId::new(0), blocked_fed("a", Time::from_ns(5), Time::EPSILON, true));
        let mut done = FederateState::new("b", &FederateInfo::default());
        done.phase = FederatePhase::Finalized;
        feds.insert(FederateId::new(1), done);

        assert!(local_floor(&feds).is_some());
    }

    #[test]
    fn test_unconverged_round_clears_flag() {
        let mut feds = HashMap::new();
        feds.insert(FederateId::new(0), blocked_fed("a", Time::from_ns(2), Time::ZERO, true));
        feds.insert(FederateId::new(1), blocked_fed("b", Time::from_ns(2), Time::ZERO, false));

        assert!(!local_floor(&feds).unwrap().converged());
    }

    #[test]
    fn test_grant_decisions() {
        // The minimum requester is satisfied exactly.
        assert_eq!(
            grant_for(Time::from_ns(5), Time::ZERO, Time::from_ns(6)),
            Some(Time::from_ns(5))
        );
        // A higher requester is woken at the floor.
        assert_eq!(
            grant_for(Time::from_ns(10), Time::ZERO, Time::from_ns(6)),
            Some(Time::from_ns(6))
        );
        // A floor at or below the granted time wakes nobody early.
        assert_eq!(grant_for(Time::from_ns(10), Time::from_ns(6), Time::from_ns(6)), None);
        // The iterative same-time case resolves at the requested time.
        assert_eq!(
            grant_for(Time::from_ns(6), Time::from_ns(6), Time::from_ns(6)),
            Some(Time::from_ns(6))
        );
    }
}
