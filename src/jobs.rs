use crate::utils::truncate_on_char_boundary;
use nix::sys::signal::Signal;
use nix::sys::wait::WaitStatus;
use nix::unistd::Pid;
use std::io::{self, Write};
use thiserror::Error;
use tracing::trace;

pub const MAX_JOBS: usize = 20;
pub const MAX_COMMAND_LEN: usize = 1023;

pub type JobId = u32;

/// Represents the state of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    Running,
    Stopped,
    Background,
    Foreground,
    Completed,
    Terminated,
}

impl JobStatus {
    /// The label shown by `jobs`; every running flavour reads "Running".
    pub fn label(self) -> &'static str {
        match self {
            JobStatus::Running | JobStatus::Background | JobStatus::Foreground => "Running",
            JobStatus::Stopped => "Stopped",
            JobStatus::Completed => "Done",
            JobStatus::Terminated => "Terminated",
        }
    }

    pub fn is_finished(self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Terminated)
    }
}

/// What the shell last learned about one member process of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    Running,
    Stopped(Signal),
    Exited(i32),
    Signaled(Signal),
}

impl ProcessState {
    pub fn is_done(self) -> bool {
        matches!(self, ProcessState::Exited(_) | ProcessState::Signaled(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Process {
    pub pid: Pid,
    pub state: ProcessState,
}

/// Represents a job in the shell: one process group, one or more stages.
#[derive(Debug, Clone)]
pub struct Job {
    /// Group leader (first stage). Zero marks a free slot.
    pub pid: Pid,
    pub pgid: Pid,
    pub command: String,
    pub status: JobStatus,
    pub job_id: JobId,
    pub is_background: bool,
    /// Every stage, in pipeline order.
    pub processes: Vec<Process>,
}

impl Job {
    fn vacant() -> Self {
        Job {
            pid: Pid::from_raw(0),
            pgid: Pid::from_raw(0),
            command: String::new(),
            status: JobStatus::Completed,
            job_id: 0,
            is_background: false,
            processes: Vec::new(),
        }
    }

    pub fn is_vacant(&self) -> bool {
        self.pid.as_raw() == 0
    }

    fn clear(&mut self) {
        *self = Job::vacant();
    }

    /// How the last stage ended, once every stage has been reaped.
    pub fn outcome(&self) -> Option<ProcessState> {
        if !self.processes.iter().all(|p| p.state.is_done()) {
            return None;
        }
        self.processes.last().map(|p| p.state)
    }

    /// `$?`-style status of a finished job: the exit code, or 128 plus the
    /// signal number for a job killed by a signal.
    pub fn exit_code(&self) -> Option<i32> {
        match self.outcome()? {
            ProcessState::Exited(code) => Some(code),
            ProcessState::Signaled(sig) => Some(128 + sig as i32),
            _ => None,
        }
    }

    /// One-line state-change notice, e.g. `[2] Stopped sleep 10`.
    pub fn notice(&self) -> String {
        match (self.status, self.outcome()) {
            (JobStatus::Completed, Some(ProcessState::Exited(code))) if code != 0 => {
                format!("[{}] Exit {} {}", self.job_id, code, self.command)
            }
            _ => format!("[{}] {} {}", self.job_id, self.status.label(), self.command),
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum JobError {
    #[error("too many jobs")]
    TableFull,
    #[error("no such job: {0}")]
    NoSuchJob(JobId),
    #[error("job [{0}] already holds the foreground")]
    ForegroundBusy(JobId),
    #[error("invalid pid {0}")]
    InvalidPid(i32),
}

/// Every job the shell launched, in fixed slots. A slot is free when its
/// `pid` is zero; `list` walks the slots in order.
pub struct JobTable {
    jobs: [Job; MAX_JOBS],
    /// Groups that stopped without ever getting a slot. Nothing can resume
    /// them; they are only hung up on exit.
    stranded: Vec<Pid>,
}

impl Default for JobTable {
    fn default() -> Self {
        Self::new()
    }
}

impl JobTable {
    /// Creates a new, empty job table.
    pub fn new() -> Self {
        JobTable {
            jobs: std::array::from_fn(|_| Job::vacant()),
            stranded: Vec::new(),
        }
    }

    /// Returns the maximum job ID currently in the table.
    fn max_job_id(&self) -> JobId {
        self.live().map(|job| job.job_id).max().unwrap_or(0)
    }

    /// Records a freshly forked group leader and returns its job id.
    ///
    /// Ids are one above the highest live id, so a live job's id is never
    /// handed out twice. Background jobs get the `[id] pid` notice.
    pub fn add(
        &mut self,
        pid: Pid,
        pgid: Pid,
        command: &str,
        status: JobStatus,
        background: bool,
    ) -> Result<JobId, JobError> {
        let leads_live_job = self
            .find_by_pid(pid)
            .is_some_and(|job| !job.status.is_finished());
        if pid.as_raw() < 1 || leads_live_job {
            return Err(JobError::InvalidPid(pid.as_raw()));
        }
        if status == JobStatus::Foreground {
            if let Some(holder) = self.foreground() {
                return Err(JobError::ForegroundBusy(holder.job_id));
            }
        }
        let job_id = self.max_job_id() + 1;
        let slot = self
            .jobs
            .iter_mut()
            .find(|job| job.is_vacant())
            .ok_or(JobError::TableFull)?;
        *slot = Job {
            pid,
            pgid,
            command: truncate_on_char_boundary(command, MAX_COMMAND_LEN).to_string(),
            status,
            job_id,
            is_background: background,
            processes: vec![Process {
                pid,
                state: ProcessState::Running,
            }],
        };
        if background {
            println!("[{}] {}", job_id, pid);
        }
        Ok(job_id)
    }

    /// Appends a later pipeline stage to an existing job.
    pub fn add_member(&mut self, job_id: JobId, pid: Pid) -> Result<(), JobError> {
        let job = self
            .find_by_job_id_mut(job_id)
            .ok_or(JobError::NoSuchJob(job_id))?;
        job.processes.push(Process {
            pid,
            state: ProcessState::Running,
        });
        Ok(())
    }

    /// Frees the slot of `job_id`. Returns false if no such job was live.
    pub fn remove(&mut self, job_id: JobId) -> bool {
        match self.find_by_job_id_mut(job_id) {
            Some(job) => {
                job.clear();
                true
            }
            None => false,
        }
    }

    pub fn find_by_pid(&self, pid: Pid) -> Option<&Job> {
        if pid.as_raw() < 1 {
            return None;
        }
        self.jobs.iter().find(|job| job.pid == pid)
    }

    pub fn find_by_pid_mut(&mut self, pid: Pid) -> Option<&mut Job> {
        if pid.as_raw() < 1 {
            return None;
        }
        self.jobs.iter_mut().find(|job| job.pid == pid)
    }

    pub fn find_by_job_id(&self, job_id: JobId) -> Option<&Job> {
        if job_id == 0 {
            return None;
        }
        self.live().find(|job| job.job_id == job_id)
    }

    pub fn find_by_job_id_mut(&mut self, job_id: JobId) -> Option<&mut Job> {
        if job_id == 0 {
            return None;
        }
        self.jobs
            .iter_mut()
            .find(|job| !job.is_vacant() && job.job_id == job_id)
    }

    /// Finds the job any stage `pid` belongs to, leader or not.
    fn find_by_member_mut(&mut self, pid: Pid) -> Option<&mut Job> {
        if pid.as_raw() < 1 {
            return None;
        }
        self.jobs
            .iter_mut()
            .find(|job| !job.is_vacant() && job.processes.iter().any(|p| p.pid == pid))
    }

    /// The job currently entitled to the terminal, if any.
    pub fn foreground(&self) -> Option<&Job> {
        self.live().find(|job| job.status == JobStatus::Foreground)
    }

    /// Sets the status of the job led by `pid`. At most one job may be in
    /// the Foreground state, so granting it to a second job fails.
    pub fn set_status(&mut self, pid: Pid, status: JobStatus) -> Result<(), JobError> {
        if status == JobStatus::Foreground {
            if let Some(holder) = self.foreground() {
                if holder.pid != pid {
                    return Err(JobError::ForegroundBusy(holder.job_id));
                }
            }
        }
        let job = self
            .find_by_pid_mut(pid)
            .ok_or(JobError::InvalidPid(pid.as_raw()))?;
        job.status = status;
        Ok(())
    }

    /// Folds one `waitpid` result into the table.
    ///
    /// Shared by the foreground wait loop and the background reaper so both
    /// go through one update path. Returns the affected job and its new
    /// status when the job-level status changed; pids that belong to no job
    /// are ignored.
    pub fn apply_wait_status(&mut self, status: WaitStatus) -> Option<(JobId, JobStatus)> {
        let (pid, state) = match status {
            WaitStatus::Exited(pid, code) => (pid, ProcessState::Exited(code)),
            WaitStatus::Signaled(pid, sig, _) => (pid, ProcessState::Signaled(sig)),
            WaitStatus::Stopped(pid, sig) => (pid, ProcessState::Stopped(sig)),
            WaitStatus::Continued(pid) => (pid, ProcessState::Running),
            _ => return None,
        };
        let Some(job) = self.find_by_member_mut(pid) else {
            trace!(%pid, "ignoring status of unknown child");
            return None;
        };
        if let Some(process) = job.processes.iter_mut().find(|p| p.pid == pid) {
            process.state = state;
        }

        let previous = job.status;
        let next = match state {
            ProcessState::Exited(_) | ProcessState::Signaled(_) => match job.outcome() {
                Some(ProcessState::Signaled(_)) => JobStatus::Terminated,
                Some(_) => JobStatus::Completed,
                None => previous,
            },
            ProcessState::Stopped(_) => JobStatus::Stopped,
            // Foreground/Background already say "running"; keep which one.
            ProcessState::Running if previous == JobStatus::Stopped => JobStatus::Running,
            ProcessState::Running => previous,
        };
        job.status = next;
        trace!(job_id = job.job_id, %pid, ?state, ?next, "applied wait status");
        (next != previous).then_some((job.job_id, next))
    }

    /// Frees every Completed/Terminated slot and hands the freed jobs back
    /// so the caller can report them. Calling it twice frees nothing more.
    pub fn sweep(&mut self) -> Vec<Job> {
        let mut finished = Vec::new();
        for job in self.jobs.iter_mut() {
            if !job.is_vacant() && job.status.is_finished() {
                finished.push(std::mem::replace(job, Job::vacant()));
            }
        }
        finished
    }

    /// Writes one `[id] Status command` line per live job, in slot order.
    pub fn list(&self, out: &mut impl Write) -> io::Result<()> {
        for job in self.live() {
            writeln!(out, "[{}] {} {}", job.job_id, job.status.label(), job.command)?;
        }
        Ok(())
    }

    /// Records a stopped group that has no slot.
    pub fn strand(&mut self, pgid: Pid) {
        self.stranded.push(pgid);
    }

    /// Process groups left stopped: stopped jobs, then stranded groups.
    pub fn stopped_groups(&self) -> impl Iterator<Item = Pid> + '_ {
        self.live()
            .filter(|job| job.status == JobStatus::Stopped)
            .map(|job| job.pgid)
            .chain(self.stranded.iter().copied())
    }

    pub fn live(&self) -> impl Iterator<Item = &Job> {
        self.jobs.iter().filter(|job| !job.is_vacant())
    }

    pub fn len(&self) -> usize {
        self.live().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn pid(raw: i32) -> Pid {
        Pid::from_raw(raw)
    }

    fn add_bg(table: &mut JobTable, raw: i32, cmd: &str) -> JobId {
        table
            .add(pid(raw), pid(raw), cmd, JobStatus::Background, false)
            .unwrap()
    }

    fn listing(table: &JobTable) -> String {
        let mut out = Vec::new();
        table.list(&mut out).unwrap();
        String::from_utf8(out).unwrap()
    }

    #[test]
    fn test_add_assigns_increasing_ids() {
        let mut table = JobTable::new();
        assert_eq!(add_bg(&mut table, 100, "sleep 1"), 1);
        assert_eq!(add_bg(&mut table, 101, "sleep 2"), 2);
        assert_eq!(table.len(), 2);
        assert_eq!(table.find_by_pid(pid(101)).unwrap().job_id, 2);
        assert_eq!(table.find_by_job_id(1).unwrap().pid, pid(100));
        assert!(table.find_by_job_id(3).is_none());
        assert!(table.find_by_pid(pid(0)).is_none());
    }

    #[test]
    fn test_add_rejects_invalid_pid() {
        let mut table = JobTable::new();
        assert_eq!(
            table.add(pid(0), pid(0), "x", JobStatus::Running, false),
            Err(JobError::InvalidPid(0))
        );
        add_bg(&mut table, 30, "sleep 9");
        assert_eq!(
            table.add(pid(30), pid(30), "again", JobStatus::Running, false),
            Err(JobError::InvalidPid(30))
        );
    }

    #[test]
    fn test_job_ids_never_alias_live_jobs() {
        let mut table = JobTable::new();
        let mut next_pid = 1000;
        // Interleave creations and removals in an irregular pattern.
        for round in 0..200 {
            if round % 3 == 2 || table.len() == MAX_JOBS {
                let victim = table
                    .live()
                    .nth(round % table.len().max(1))
                    .map(|job| job.job_id);
                if let Some(id) = victim {
                    assert!(table.remove(id));
                }
            } else {
                add_bg(&mut table, next_pid, "job");
                next_pid += 1;
            }
            let mut ids: Vec<JobId> = table.live().map(|job| job.job_id).collect();
            let count = ids.len();
            ids.sort_unstable();
            ids.dedup();
            assert_eq!(ids.len(), count, "duplicate job id after round {round}");
        }
    }

    #[test]
    fn test_table_full() {
        let mut table = JobTable::new();
        for i in 0..MAX_JOBS as i32 {
            add_bg(&mut table, 200 + i, "spin");
        }
        assert_eq!(
            table.add(pid(999), pid(999), "one more", JobStatus::Background, false),
            Err(JobError::TableFull)
        );
        assert_eq!(table.len(), MAX_JOBS);
    }

    #[test]
    fn test_freed_slot_is_reused_in_place() {
        let mut table = JobTable::new();
        add_bg(&mut table, 10, "a");
        let second = add_bg(&mut table, 11, "b");
        add_bg(&mut table, 12, "c");
        assert!(table.remove(second));
        assert!(!table.remove(second));
        let fourth = add_bg(&mut table, 13, "d");
        assert_eq!(fourth, 4);
        assert_eq!(listing(&table), "[1] Running a\n[4] Running d\n[3] Running c\n");
    }

    #[test]
    fn test_at_most_one_foreground() {
        let mut table = JobTable::new();
        table
            .add(pid(50), pid(50), "vim", JobStatus::Foreground, false)
            .unwrap();
        assert_eq!(
            table.add(pid(51), pid(51), "less", JobStatus::Foreground, false),
            Err(JobError::ForegroundBusy(1))
        );
        add_bg(&mut table, 52, "make");
        assert_eq!(
            table.set_status(pid(52), JobStatus::Foreground),
            Err(JobError::ForegroundBusy(1))
        );
        // The holder itself may be re-marked.
        assert_eq!(table.set_status(pid(50), JobStatus::Foreground), Ok(()));

        table.set_status(pid(50), JobStatus::Stopped).unwrap();
        assert_eq!(table.set_status(pid(52), JobStatus::Foreground), Ok(()));
        let foreground: Vec<_> = table
            .live()
            .filter(|job| job.status == JobStatus::Foreground)
            .collect();
        assert_eq!(foreground.len(), 1);
        assert_eq!(table.foreground().unwrap().pid, pid(52));
    }

    #[test]
    fn test_list_labels() {
        let mut table = JobTable::new();
        add_bg(&mut table, 1, "bg job");
        table.add(pid(2), pid(2), "fg job", JobStatus::Foreground, false).unwrap();
        table.add(pid(3), pid(3), "stopped job", JobStatus::Stopped, false).unwrap();
        table.add(pid(4), pid(4), "done job", JobStatus::Completed, false).unwrap();
        table.add(pid(5), pid(5), "killed job", JobStatus::Terminated, false).unwrap();
        table.add(pid(6), pid(6), "plain job", JobStatus::Running, false).unwrap();
        assert_eq!(
            listing(&table),
            "[1] Running bg job\n\
             [2] Running fg job\n\
             [3] Stopped stopped job\n\
             [4] Done done job\n\
             [5] Terminated killed job\n\
             [6] Running plain job\n"
        );
    }

    #[test]
    fn test_sweep_frees_finished_jobs_once() {
        let mut table = JobTable::new();
        add_bg(&mut table, 1, "a");
        add_bg(&mut table, 2, "b");
        add_bg(&mut table, 3, "c");
        table.set_status(pid(1), JobStatus::Completed).unwrap();
        table.set_status(pid(3), JobStatus::Terminated).unwrap();

        let swept: Vec<JobId> = table.sweep().iter().map(|job| job.job_id).collect();
        assert_eq!(swept, vec![1, 3]);
        assert!(table.sweep().is_empty());
        assert_eq!(listing(&table), "[2] Running b\n");
    }

    #[test]
    fn test_command_is_bounded() {
        let mut table = JobTable::new();
        let long = "x".repeat(MAX_COMMAND_LEN * 2);
        add_bg(&mut table, 7, &long);
        assert_eq!(table.find_by_pid(pid(7)).unwrap().command.len(), MAX_COMMAND_LEN);
    }

    #[test]
    fn test_wait_status_single_command_lifecycle() {
        let mut table = JobTable::new();
        let id = add_bg(&mut table, 40, "cat");

        assert_eq!(
            table.apply_wait_status(WaitStatus::Stopped(pid(40), Signal::SIGTSTP)),
            Some((id, JobStatus::Stopped))
        );
        assert_eq!(
            table.apply_wait_status(WaitStatus::Continued(pid(40))),
            Some((id, JobStatus::Running))
        );
        assert_eq!(
            table.apply_wait_status(WaitStatus::Exited(pid(40), 3)),
            Some((id, JobStatus::Completed))
        );
        let job = table.find_by_job_id(id).unwrap();
        assert_eq!(job.exit_code(), Some(3));
        assert_eq!(job.notice(), "[1] Exit 3 cat");
    }

    #[test]
    fn test_continue_keeps_running_flavour() {
        let mut table = JobTable::new();
        let id = add_bg(&mut table, 41, "make");
        assert_eq!(table.apply_wait_status(WaitStatus::Continued(pid(41))), None);
        assert_eq!(table.find_by_job_id(id).unwrap().status, JobStatus::Background);
    }

    #[test]
    fn test_wait_status_signal_death() {
        let mut table = JobTable::new();
        let id = add_bg(&mut table, 42, "yes");
        assert_eq!(
            table.apply_wait_status(WaitStatus::Signaled(pid(42), Signal::SIGINT, false)),
            Some((id, JobStatus::Terminated))
        );
        let job = table.find_by_job_id(id).unwrap();
        assert_eq!(job.exit_code(), Some(130));
        assert_eq!(job.notice(), "[1] Terminated yes");
    }

    #[test]
    fn test_pipeline_completes_after_every_stage() {
        let mut table = JobTable::new();
        let id = table
            .add(pid(60), pid(60), "printf x | sort", JobStatus::Foreground, false)
            .unwrap();
        table.add_member(id, pid(61)).unwrap();

        // Leader exits first: job still has a running stage.
        assert_eq!(table.apply_wait_status(WaitStatus::Exited(pid(60), 0)), None);
        assert_eq!(table.find_by_job_id(id).unwrap().status, JobStatus::Foreground);

        assert_eq!(
            table.apply_wait_status(WaitStatus::Exited(pid(61), 0)),
            Some((id, JobStatus::Completed))
        );
        assert_eq!(table.find_by_job_id(id).unwrap().notice(), "[1] Done printf x | sort");
    }

    #[test]
    fn test_pipeline_outcome_follows_last_stage() {
        let mut table = JobTable::new();
        let id = add_bg(&mut table, 70, "yes | head -1");
        table.add_member(id, pid(71)).unwrap();

        table.apply_wait_status(WaitStatus::Exited(pid(71), 0));
        assert_eq!(
            table.apply_wait_status(WaitStatus::Signaled(pid(70), Signal::SIGPIPE, false)),
            Some((id, JobStatus::Completed))
        );
        assert_eq!(table.find_by_job_id(id).unwrap().exit_code(), Some(0));
    }

    #[test]
    fn test_any_stage_stopping_stops_the_job() {
        let mut table = JobTable::new();
        let id = add_bg(&mut table, 80, "cat | less");
        table.add_member(id, pid(81)).unwrap();
        assert_eq!(
            table.apply_wait_status(WaitStatus::Stopped(pid(81), Signal::SIGTTIN)),
            Some((id, JobStatus::Stopped))
        );
        assert_eq!(
            table.apply_wait_status(WaitStatus::Stopped(pid(80), Signal::SIGTTIN)),
            None
        );
    }

    #[test]
    fn test_stopped_groups_include_stranded() {
        let mut table = JobTable::new();
        add_bg(&mut table, 40, "sleep 9");
        let stopped = add_bg(&mut table, 41, "vi");
        table.find_by_job_id_mut(stopped).unwrap().status = JobStatus::Stopped;
        table.strand(pid(77));

        let groups: Vec<Pid> = table.stopped_groups().collect();
        assert_eq!(groups, vec![pid(41), pid(77)]);
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn test_unknown_pid_is_ignored() {
        let mut table = JobTable::new();
        add_bg(&mut table, 90, "a");
        assert_eq!(table.apply_wait_status(WaitStatus::Exited(pid(12345), 0)), None);
        assert_eq!(table.apply_wait_status(WaitStatus::StillAlive), None);
        assert_eq!(table.len(), 1);
    }
}
