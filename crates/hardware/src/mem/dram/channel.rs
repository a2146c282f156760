//! Per-channel command scheduling: bank state machines, timing windows,
//! refresh, and power-down.
//!
//! Each bank is in exactly one phase; permitted transitions are gated by a
//! per-bank table of the next cycle at which each command class becomes
//! legal. The scheduler issues at most one command per channel per DRAM
//! tick, in this priority order: forced refresh, then the policy pick over
//! the read/write queues (row-hit first, then first-come-first-served),
//! then opportunistic refresh, then power-down entry.
//!
//! Refresh bookkeeping owes eight auto-refreshes per window of
//! `8 * t_refi`; the issue deadline is computed so eight back-to-back
//! refreshes plus a precharge still fit before the window closes, which is
//! what makes a missed deadline impossible by construction.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, VecDeque};

use tracing::trace;

use super::config::{DramConfig, DramTiming};
use super::decode::DramAddress;
use crate::common::{Cycles, Paddr};

/// Bank phase.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum BankPhase {
    /// All rows closed, ready for activate.
    Idle,
    /// One row open in the row buffer.
    RowActive,
    /// Row closing; activate legal after `t_rp`.
    Precharging,
    /// Auto-refresh in progress.
    Refreshing,
    /// Powered down with a row open.
    ActivePdn,
    /// Powered down, rows closed, fast exit.
    PrechargePdnFast,
    /// Powered down, rows closed, DLL off, slow exit.
    PrechargePdnSlow,
}

/// Per-bank timing state: current phase plus the next legal cycle for each
/// command class.
#[derive(Clone, Copy, Debug)]
pub struct BankState {
    pub phase: BankPhase,
    pub active_row: Option<u64>,
    pub next_act: u64,
    pub next_read: u64,
    pub next_write: u64,
    pub next_pre: u64,
    pub next_refresh: u64,
    pub next_powerdown: u64,
    pub next_powerup: u64,
}

impl Default for BankState {
    fn default() -> Self {
        Self {
            phase: BankPhase::Idle,
            active_row: None,
            next_act: 0,
            next_read: 0,
            next_write: 0,
            next_pre: 0,
            next_refresh: 0,
            next_powerdown: 0,
            next_powerup: 0,
        }
    }
}

/// Per-rank refresh and activation-window state.
#[derive(Clone, Debug)]
pub struct RankState {
    /// Activate timestamps inside the rolling `t_faw` window.
    pub act_window: VecDeque<u64>,
    /// Absolute end of the current refresh window.
    pub window_end: u64,
    /// Latest cycle at which the first of the remaining refreshes must
    /// issue to still make the window.
    pub issue_deadline: u64,
    /// Refreshes issued inside the current window.
    pub issued_refreshes: u64,
    /// Refresh deadline pressure: all other commands are suppressed.
    pub forced_refresh: bool,
    /// Last cycle the rank did useful work; drives power-down entry.
    pub last_activity: u64,
}

impl RankState {
    fn new(timing: &DramTiming) -> Self {
        let window_end = 8 * timing.t_refi;
        Self {
            act_window: VecDeque::new(),
            window_end,
            issue_deadline: window_end - timing.t_rp - 8 * timing.t_rfc,
            issued_refreshes: 0,
            forced_refresh: false,
            last_activity: 0,
        }
    }
}

/// The command a queued request needs next.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum NextCommand {
    Activate,
    ColumnRead,
    ColumnWrite,
    Precharge,
    PowerUp,
}

/// A read waiting in the channel, with every coalesced waiter's return id.
#[derive(Clone, Debug)]
pub struct QueuedRead {
    pub paddr: Paddr,
    pub addr: DramAddress,
    pub arrival: u64,
    pub return_ids: Vec<u32>,
}

/// A write waiting in the channel. Data is applied to the backing store at
/// insertion; the queue entry only models timing.
#[derive(Clone, Copy, Debug)]
pub struct QueuedWrite {
    pub paddr: Paddr,
    pub addr: DramAddress,
    pub arrival: u64,
}

/// One DRAM channel: queues, bank/rank state, and the completion heap.
pub struct DramChannel {
    pub read_queue: Vec<QueuedRead>,
    pub write_queue: Vec<QueuedWrite>,
    pub banks: Vec<Vec<BankState>>,
    pub ranks: Vec<RankState>,
    /// (simulator-cycle, return id) pairs ordered by completion.
    pub completions: BinaryHeap<Reverse<(Cycles, u32)>>,
    write_drain: bool,
}

/// Counters the channel reports into the unit log.
#[derive(Clone, Copy, Default)]
pub struct ChannelEvents {
    pub activates: u64,
    pub row_hits: u64,
    pub precharges: u64,
    pub refreshes: u64,
    pub powerdowns: u64,
}

impl DramChannel {
    pub fn new(config: &DramConfig) -> Self {
        Self {
            read_queue: Vec::new(),
            write_queue: Vec::new(),
            banks: (0..config.num_ranks)
                .map(|_| vec![BankState::default(); config.num_banks as usize])
                .collect(),
            ranks: (0..config.num_ranks)
                .map(|_| RankState::new(&config.timing))
                .collect(),
            completions: BinaryHeap::new(),
            write_drain: false,
        }
    }

    /// Returns the read queue entry matching `line`, if any.
    pub fn matching_read(&mut self, line: Paddr) -> Option<&mut QueuedRead> {
        self.read_queue.iter_mut().find(|r| r.paddr == line)
    }

    /// Returns `true` when a write to `line` is queued.
    pub fn matching_write(&self, line: Paddr) -> bool {
        self.write_queue.iter().any(|w| w.paddr == line)
    }

    pub fn is_idle(&self) -> bool {
        self.read_queue.is_empty() && self.write_queue.is_empty() && self.completions.is_empty()
    }

    fn next_command_for(&self, addr: &DramAddress, is_write: bool, now: u64) -> (NextCommand, bool) {
        let rank = &self.ranks[addr.rank as usize];
        let bank = &self.banks[addr.rank as usize][addr.bank as usize];
        if rank.forced_refresh {
            // The refresh burst owns the rank.
            return (NextCommand::Activate, false);
        }
        match bank.phase {
            BankPhase::Idle | BankPhase::Precharging | BankPhase::Refreshing => {
                let faw_ok = rank.act_window.len() < 4;
                (NextCommand::Activate, now >= bank.next_act && faw_ok)
            }
            BankPhase::RowActive => {
                if bank.active_row == Some(addr.row) {
                    if is_write {
                        (NextCommand::ColumnWrite, now >= bank.next_write)
                    } else {
                        (NextCommand::ColumnRead, now >= bank.next_read)
                    }
                } else {
                    (NextCommand::Precharge, now >= bank.next_pre)
                }
            }
            BankPhase::ActivePdn | BankPhase::PrechargePdnFast | BankPhase::PrechargePdnSlow => {
                (NextCommand::PowerUp, now >= bank.next_powerup)
            }
        }
    }

    fn expire_faw(&mut self, now: u64, timing: &DramTiming) {
        for rank in &mut self.ranks {
            while let Some(&t) = rank.act_window.front() {
                if t + timing.t_faw <= now {
                    rank.act_window.pop_front();
                } else {
                    break;
                }
            }
        }
    }

    fn refresh_legal(&self, rank_index: usize, now: u64) -> bool {
        self.banks[rank_index].iter().all(|b| {
            now >= b.next_refresh
                && !matches!(
                    b.phase,
                    BankPhase::ActivePdn | BankPhase::PrechargePdnFast | BankPhase::PrechargePdnSlow
                )
        })
    }

    fn issue_refresh(&mut self, rank_index: usize, now: u64, timing: &DramTiming) {
        let any_open = self.banks[rank_index]
            .iter()
            .any(|b| b.phase == BankPhase::RowActive);
        let done = now + timing.t_rfc + if any_open { timing.t_rp } else { 0 };
        for bank in &mut self.banks[rank_index] {
            bank.phase = BankPhase::Refreshing;
            bank.active_row = None;
            bank.next_act = bank.next_act.max(done);
            bank.next_pre = bank.next_pre.max(done);
            bank.next_refresh = bank.next_refresh.max(done);
            bank.next_powerdown = bank.next_powerdown.max(done);
        }

        let rank = &mut self.ranks[rank_index];
        rank.issued_refreshes += 1;
        rank.last_activity = now;
        trace!(rank = rank_index, n = rank.issued_refreshes, "refresh issued");
        if rank.issued_refreshes == 8 {
            rank.window_end += 8 * timing.t_refi;
            rank.issue_deadline = rank.window_end - timing.t_rp - 8 * timing.t_rfc;
            rank.issued_refreshes = 0;
            rank.forced_refresh = false;
        }
    }

    fn power_up(&mut self, rank_index: usize, bank_index: usize, now: u64, timing: &DramTiming) {
        let slow = self.banks[rank_index][bank_index].phase == BankPhase::PrechargePdnSlow;
        let exit = now + if slow { timing.t_xp_dll } else { timing.t_xp };
        for bank in &mut self.banks[rank_index] {
            bank.phase = if bank.active_row.is_some() {
                BankPhase::RowActive
            } else {
                BankPhase::Idle
            };
            bank.next_act = bank.next_act.max(exit);
            bank.next_read = bank.next_read.max(exit);
            bank.next_write = bank.next_write.max(exit);
            bank.next_pre = bank.next_pre.max(exit);
            bank.next_refresh = bank.next_refresh.max(exit);
        }
        self.ranks[rank_index].last_activity = now;
    }

    fn issue_activate(&mut self, addr: &DramAddress, now: u64, timing: &DramTiming) {
        let (r, b) = (addr.rank as usize, addr.bank as usize);
        {
            let bank = &mut self.banks[r][b];
            assert!(
                matches!(
                    bank.phase,
                    BankPhase::Idle | BankPhase::Precharging | BankPhase::Refreshing
                ),
                "activate issued to a bank in {:?}",
                bank.phase
            );
            bank.phase = BankPhase::RowActive;
            bank.active_row = Some(addr.row);
            bank.next_pre = bank.next_pre.max(now + timing.t_ras);
            bank.next_refresh = bank.next_refresh.max(now + timing.t_ras);
            bank.next_read = bank.next_read.max(now + timing.t_rcd);
            bank.next_write = bank.next_write.max(now + timing.t_rcd);
            bank.next_act = bank.next_act.max(now + timing.t_rc);
            bank.next_powerdown = bank.next_powerdown.max(now + timing.t_rcd);
        }
        for (i, bank) in self.banks[r].iter_mut().enumerate() {
            if i != b {
                bank.next_act = bank.next_act.max(now + timing.t_rrd);
            }
        }
        self.ranks[r].act_window.push_back(now);
        self.ranks[r].last_activity = now;
    }

    fn issue_column_read(&mut self, addr: &DramAddress, now: u64, timing: &DramTiming) -> u64 {
        let (r, b) = (addr.rank as usize, addr.bank as usize);
        assert!(self.banks[r][b].phase == BankPhase::RowActive);
        {
            let bank = &mut self.banks[r][b];
            bank.next_pre = bank.next_pre.max(now + timing.t_rtp);
            bank.next_refresh = bank.next_refresh.max(now + timing.t_rtp);
            bank.next_powerdown = bank.next_powerdown.max(now + timing.t_rtp);
        }
        for (rank_index, rank_banks) in self.banks.iter_mut().enumerate() {
            for bank in rank_banks.iter_mut() {
                if rank_index == r {
                    bank.next_read = bank.next_read.max(now + timing.t_ccd.max(timing.t_data_trans));
                } else {
                    bank.next_read = bank.next_read.max(now + timing.t_data_trans + timing.t_rtrs);
                }
                bank.next_write = bank
                    .next_write
                    .max((now + timing.t_cas + timing.t_data_trans + timing.t_rtrs)
                        .saturating_sub(timing.t_cwd));
            }
        }
        self.ranks[r].last_activity = now;
        now + timing.t_cas + timing.t_data_trans
    }

    fn issue_column_write(&mut self, addr: &DramAddress, now: u64, timing: &DramTiming) {
        let (r, b) = (addr.rank as usize, addr.bank as usize);
        assert!(self.banks[r][b].phase == BankPhase::RowActive);
        let recovery = now + timing.t_cwd + timing.t_data_trans + timing.t_wr;
        {
            let bank = &mut self.banks[r][b];
            bank.next_pre = bank.next_pre.max(recovery);
            bank.next_refresh = bank.next_refresh.max(recovery);
            bank.next_powerdown = bank.next_powerdown.max(recovery);
        }
        for (rank_index, rank_banks) in self.banks.iter_mut().enumerate() {
            for bank in rank_banks.iter_mut() {
                if rank_index == r {
                    bank.next_write = bank.next_write.max(now + timing.t_ccd.max(timing.t_data_trans));
                    bank.next_read = bank
                        .next_read
                        .max(now + timing.t_cwd + timing.t_data_trans + timing.t_wtr);
                } else {
                    bank.next_write = bank.next_write.max(now + timing.t_data_trans + timing.t_rtrs);
                    bank.next_read = bank.next_read.max(
                        (now + timing.t_cwd + timing.t_data_trans + timing.t_rtrs)
                            .saturating_sub(timing.t_cas),
                    );
                }
            }
        }
        self.ranks[r].last_activity = now;
    }

    fn issue_precharge(&mut self, addr: &DramAddress, now: u64, timing: &DramTiming) {
        let bank = &mut self.banks[addr.rank as usize][addr.bank as usize];
        assert!(
            matches!(bank.phase, BankPhase::RowActive),
            "precharge issued to a bank in {:?}",
            bank.phase
        );
        bank.phase = BankPhase::Precharging;
        bank.active_row = None;
        bank.next_act = bank.next_act.max(now + timing.t_rp);
        bank.next_refresh = bank.next_refresh.max(now + timing.t_rp);
        bank.next_powerdown = bank.next_powerdown.max(now + timing.t_rp);
        self.ranks[addr.rank as usize].last_activity = now;
    }

    /// Closes the row behind a column access when no queued request still
    /// targets it.
    fn auto_precharge(&mut self, addr: &DramAddress, now: u64, timing: &DramTiming, was_write: bool) {
        let still_wanted = self
            .read_queue
            .iter()
            .any(|r| r.addr.rank == addr.rank && r.addr.bank == addr.bank && r.addr.row == addr.row)
            || self
                .write_queue
                .iter()
                .any(|w| w.addr.rank == addr.rank && w.addr.bank == addr.bank && w.addr.row == addr.row);
        if still_wanted {
            return;
        }
        let close_at = if was_write {
            now + timing.t_cwd + timing.t_data_trans + timing.t_wr
        } else {
            now + timing.t_rtp
        };
        let bank = &mut self.banks[addr.rank as usize][addr.bank as usize];
        bank.phase = BankPhase::Precharging;
        bank.active_row = None;
        bank.next_act = bank.next_act.max(close_at + timing.t_rp);
        bank.next_refresh = bank.next_refresh.max(close_at + timing.t_rp);
    }

    /// Runs one DRAM tick: refresh pressure, command selection, issue, and
    /// power-down entry. Returns completed-read (cycle, id) pairs pushed
    /// into the heap as a side effect.
    pub fn tick(&mut self, now: u64, config: &DramConfig, events: &mut ChannelEvents) {
        let timing = config.timing;
        self.expire_faw(now, &timing);

        // Refresh deadline pressure.
        for rank_index in 0..self.ranks.len() {
            let rank = &mut self.ranks[rank_index];
            if !rank.forced_refresh && now >= rank.issue_deadline {
                rank.forced_refresh = true;
            }
        }
        for rank_index in 0..self.ranks.len() {
            if self.ranks[rank_index].forced_refresh && self.refresh_legal(rank_index, now) {
                self.issue_refresh(rank_index, now, &timing);
                events.refreshes += 1;
                return;
            }
        }

        // Write-drain hysteresis.
        if self.write_queue.len() >= config.write_drain_high
            || (self.read_queue.is_empty() && !self.write_queue.is_empty())
        {
            self.write_drain = true;
        }
        if self.write_drain && self.write_queue.len() <= config.write_drain_low {
            self.write_drain = false;
        }

        if self.try_issue_queued(now, config, events) {
            return;
        }

        // Opportunistic refresh while the channel has nothing better to do.
        // Only inside the current window, so each window gets exactly its
        // eight commands.
        if self.read_queue.is_empty() && self.write_queue.is_empty() {
            for rank_index in 0..self.ranks.len() {
                let behind = {
                    let rank = &self.ranks[rank_index];
                    let window_start = rank.window_end.saturating_sub(8 * timing.t_refi);
                    rank.issued_refreshes < 8 && now >= window_start
                };
                if behind && self.refresh_legal(rank_index, now) {
                    self.issue_refresh(rank_index, now, &timing);
                    events.refreshes += 1;
                    return;
                }
            }
        }

        // Power-down entry after a configured idle period.
        if let Some(idle) = config.idle_powerdown_cycles {
            if self.read_queue.is_empty() && self.write_queue.is_empty() {
                for rank_index in 0..self.ranks.len() {
                    let rank_idle = now.saturating_sub(self.ranks[rank_index].last_activity) >= idle;
                    let already_down = self.banks[rank_index].iter().any(|b| {
                        matches!(
                            b.phase,
                            BankPhase::ActivePdn
                                | BankPhase::PrechargePdnFast
                                | BankPhase::PrechargePdnSlow
                        )
                    });
                    let legal = self.banks[rank_index]
                        .iter()
                        .all(|b| now >= b.next_powerdown && b.phase != BankPhase::Refreshing);
                    if rank_idle && !already_down && legal && !self.ranks[rank_index].forced_refresh {
                        let any_open = self.banks[rank_index]
                            .iter()
                            .any(|b| b.phase == BankPhase::RowActive);
                        for bank in &mut self.banks[rank_index] {
                            bank.phase = if any_open {
                                BankPhase::ActivePdn
                            } else {
                                BankPhase::PrechargePdnSlow
                            };
                            bank.next_powerup = now + timing.t_pd_min;
                        }
                        events.powerdowns += 1;
                        return;
                    }
                }
            }
        }
    }

    /// Picks and issues one command for the queued requests. Row-hit first,
    /// then oldest-first, reads unless write-drain holds.
    fn try_issue_queued(&mut self, now: u64, config: &DramConfig, events: &mut ChannelEvents) -> bool {
        let timing = config.timing;

        let pick = |issuable: &[(usize, NextCommand)]| -> Option<(usize, NextCommand)> {
            issuable
                .iter()
                .find(|(_, cmd)| matches!(cmd, NextCommand::ColumnRead | NextCommand::ColumnWrite))
                .or_else(|| issuable.first())
                .copied()
        };

        let serve_writes = self.write_drain && !self.write_queue.is_empty();
        if !serve_writes {
            let issuable: Vec<(usize, NextCommand)> = self
                .read_queue
                .iter()
                .enumerate()
                .filter_map(|(i, r)| {
                    let (cmd, ok) = self.next_command_for(&r.addr, false, now);
                    ok.then_some((i, cmd))
                })
                .collect();
            if let Some((index, cmd)) = pick(&issuable) {
                let addr = self.read_queue[index].addr;
                match cmd {
                    NextCommand::Activate => {
                        self.issue_activate(&addr, now, &timing);
                        events.activates += 1;
                    }
                    NextCommand::Precharge => {
                        self.issue_precharge(&addr, now, &timing);
                        events.precharges += 1;
                    }
                    NextCommand::PowerUp => {
                        self.power_up(addr.rank as usize, addr.bank as usize, now, &timing);
                    }
                    NextCommand::ColumnRead => {
                        let done = self.issue_column_read(&addr, now, &timing);
                        events.row_hits += 1;
                        let read = self.read_queue.remove(index);
                        let sim_cycle = done / config.clock_multiplier;
                        for id in read.return_ids {
                            self.completions.push(Reverse((sim_cycle, id)));
                        }
                        if config.auto_precharge {
                            self.auto_precharge(&addr, now, &timing, false);
                        }
                    }
                    NextCommand::ColumnWrite => unreachable!("read queue produced a write command"),
                }
                return true;
            }
        }

        if !self.write_queue.is_empty() && (serve_writes || self.read_queue.is_empty()) {
            let issuable: Vec<(usize, NextCommand)> = self
                .write_queue
                .iter()
                .enumerate()
                .filter_map(|(i, w)| {
                    let (cmd, ok) = self.next_command_for(&w.addr, true, now);
                    ok.then_some((i, cmd))
                })
                .collect();
            if let Some((index, cmd)) = pick(&issuable) {
                let addr = self.write_queue[index].addr;
                match cmd {
                    NextCommand::Activate => {
                        self.issue_activate(&addr, now, &timing);
                        events.activates += 1;
                    }
                    NextCommand::Precharge => {
                        self.issue_precharge(&addr, now, &timing);
                        events.precharges += 1;
                    }
                    NextCommand::PowerUp => {
                        self.power_up(addr.rank as usize, addr.bank as usize, now, &timing);
                    }
                    NextCommand::ColumnWrite => {
                        self.issue_column_write(&addr, now, &timing);
                        events.row_hits += 1;
                        let _ = self.write_queue.remove(index);
                        if config.auto_precharge {
                            self.auto_precharge(&addr, now, &timing, true);
                        }
                    }
                    NextCommand::ColumnRead => unreachable!("write queue produced a read command"),
                }
                return true;
            }
        }

        false
    }
}
