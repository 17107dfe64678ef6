//! Worker pool.
//!
//! Workers take one runnable item at a time: unattached work from the run
//! queue first, otherwise the head of any connection FIFO whose
//! `work_active` is clear. Claiming a connection sets `work_active`, which
//! keeps every other worker off that connection until the item finishes.

use std::sync::Arc;

use tracing::trace;

use crate::mgr::{Shared, State};
use crate::work::{self, WorkStatus};

pub(crate) fn worker_loop(shared: Arc<Shared>, id: usize) {
    trace!(worker = id, "worker started");
    loop {
        let mut st = shared.state.lock();
        let (item, owner) = loop {
            if let Some(w) = st.run_queue.pop_front() {
                break (w, None);
            }
            if let Some(idx) = pick_connection(&st) {
                let con = st.reg.get_mut(idx).expect("picked from live ids");
                con.work_active = true;
                let w = con.work_queue.pop_front().expect("picked non-empty queue");
                break (w, Some(idx));
            }
            if st.quit_workers {
                trace!(worker = id, "worker exiting");
                return;
            }
            shared.worker_sleep.wait(&mut st);
        };
        drop(st);

        work::execute(&shared, item, WorkStatus::Run);

        if let Some(idx) = owner {
            let mut st = shared.state.lock();
            if let Some(con) = st.reg.get_mut(idx) {
                con.work_active = false;
            }
        }
        // the watch loop re-evaluates interest after every work item
        shared.pollctl.interrupt();
        shared.watch_sleep.notify_all();
    }
}

/// First connection with queued work and no worker on it.
fn pick_connection(st: &State) -> Option<usize> {
    st.reg.live_ids().into_iter().find(|&idx| {
        st.reg
            .get(idx)
            .map(|c| !c.work_active && !c.work_queue.is_empty())
            .unwrap_or(false)
    })
}
