//! Scripted transport for unit tests.
//!
//! Clones share one [`Script`]: a test keeps a clone, hands another to the
//! connection, and inspects or adjusts the script between calls.

use std::collections::VecDeque;
use std::io;
use std::os::unix::io::RawFd;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use crate::notification::Notification;

use super::{
    CancelToken, ConnStatus, ExecStatus, NoticeProcessor, Params, PollingStatus, RawResult,
    Transport,
};

/// What the next `copy_read_line` call produces.
#[derive(Debug, Clone)]
pub(crate) enum CopyRead {
    /// A line; the terminator is appended by the mock.
    Line(&'static str),
    /// A raw return code.
    Code(isize),
}

pub(crate) struct Script {
    pub status: ConnStatus,
    pub poll_steps: VecDeque<PollingStatus>,
    pub protocol_version: i32,
    pub server_version: i32,
    pub error_message: String,
    pub encoding: Option<String>,

    /// Every command text sent, in order. Prepared statements are recorded
    /// as `PREPARE name AS query` and executions as `EXECUTE name`.
    pub sent: Vec<String>,
    /// Parameter counts of parameterized sends, in order.
    pub param_counts: Vec<usize>,
    pub refuse_send: bool,
    /// Drop the connection right after the next command is sent.
    pub lose_connection_on_send: bool,
    /// Result batches, one per sent command. Missing batches default to a
    /// single empty `CommandOk`.
    pub responses: VecDeque<Vec<RawResult>>,
    /// Results `get_result` hands out next.
    pub pending: VecDeque<RawResult>,

    pub copy_reads: VecDeque<CopyRead>,
    pub copy_writes: Vec<Vec<u8>>,
    pub put_data_codes: VecDeque<i32>,
    pub put_end_codes: VecDeque<i32>,
    pub copy_end: Vec<Option<String>>,

    pub consume_fails: bool,
    pub notifications: VecDeque<Notification>,
    /// Delivered by the next `wait_readable`.
    pub arrive_on_wait: VecDeque<Notification>,
    pub waits: Vec<Duration>,

    pub finished: usize,
    notice_processor: Option<NoticeProcessor>,
}

impl Script {
    /// Push a notice through the installed processor, as the server would.
    pub fn emit_notice(&mut self, text: &str) {
        if let Some(processor) = &mut self.notice_processor {
            processor(text);
        }
    }

    pub fn has_notice_processor(&self) -> bool {
        self.notice_processor.is_some()
    }

    pub fn respond(&mut self, batch: Vec<RawResult>) {
        self.responses.push_back(batch);
    }

    pub fn notify(&mut self, channel: &str, payload: &str, pid: u32) {
        self.notifications.push_back(Notification {
            channel: channel.to_string(),
            payload: payload.to_string(),
            backend_pid: pid,
        });
    }
}

impl Default for Script {
    fn default() -> Self {
        Self {
            status: ConnStatus::Ok,
            poll_steps: VecDeque::new(),
            protocol_version: 3,
            server_version: 160000,
            error_message: String::new(),
            encoding: Some("UTF8".to_string()),
            sent: Vec::new(),
            param_counts: Vec::new(),
            refuse_send: false,
            lose_connection_on_send: false,
            responses: VecDeque::new(),
            pending: VecDeque::new(),
            copy_reads: VecDeque::new(),
            copy_writes: Vec::new(),
            put_data_codes: VecDeque::new(),
            put_end_codes: VecDeque::new(),
            copy_end: Vec::new(),
            consume_fails: false,
            notifications: VecDeque::new(),
            arrive_on_wait: VecDeque::new(),
            waits: Vec::new(),
            finished: 0,
            notice_processor: None,
        }
    }
}

#[derive(Clone, Default)]
pub(crate) struct MockTransport {
    script: Arc<Mutex<Script>>,
    // Mirrors of script fields handed out by reference.
    error_message: String,
    encoding: Option<String>,
}

impl MockTransport {
    pub fn new() -> Self {
        let mut mock = Self::default();
        mock.sync();
        mock
    }

    pub fn script(&self) -> MutexGuard<'_, Script> {
        self.script.lock().unwrap()
    }

    fn sync(&mut self) {
        let script = self.script.lock().unwrap();
        self.error_message = script.error_message.clone();
        self.encoding = script.encoding.clone();
    }

    fn send(&mut self, text: String, params: Option<&Params>) -> bool {
        let sent = {
            let mut script = self.script();
            if script.refuse_send || script.status != ConnStatus::Ok {
                false
            } else {
                script.sent.push(text);
                if let Some(params) = params {
                    script.param_counts.push(params.len());
                }
                let batch = script
                    .responses
                    .pop_front()
                    .unwrap_or_else(|| vec![RawResult::new(ExecStatus::CommandOk)]);
                script.pending = batch.into();
                if script.lose_connection_on_send {
                    script.pending.clear();
                    script.status = ConnStatus::Bad;
                }
                true
            }
        };
        self.sync();
        sent
    }
}

impl Transport for MockTransport {
    fn status(&self) -> ConnStatus {
        self.script().status
    }

    fn poll_connect(&mut self) -> PollingStatus {
        let step = self.script().poll_steps.pop_front();
        self.sync();
        step.unwrap_or(PollingStatus::Ok)
    }

    fn protocol_version(&self) -> i32 {
        self.script().protocol_version
    }

    fn server_version(&self) -> i32 {
        self.script().server_version
    }

    fn backend_pid(&self) -> u32 {
        4242
    }

    fn error_message(&self) -> &str {
        &self.error_message
    }

    fn client_encoding(&self) -> Option<&str> {
        self.encoding.as_deref()
    }

    fn db_name(&self) -> &str {
        "mockdb"
    }

    fn user_name(&self) -> &str {
        "mocker"
    }

    fn host(&self) -> &str {
        "mockhost"
    }

    fn port(&self) -> u16 {
        5432
    }

    fn send_query(&mut self, query: &str) -> bool {
        self.send(query.to_string(), None)
    }

    fn send_query_params(&mut self, query: &str, params: &Params) -> bool {
        self.send(query.to_string(), Some(params))
    }

    fn send_prepare(&mut self, name: &str, query: &str) -> bool {
        self.send(format!("PREPARE {name} AS {query}"), None)
    }

    fn send_query_prepared(&mut self, name: &str, params: &Params) -> bool {
        self.send(format!("EXECUTE {name}"), Some(params))
    }

    fn get_result(&mut self) -> Option<RawResult> {
        let result = self.script().pending.pop_front();
        self.sync();
        result
    }

    fn copy_read_line(&mut self, buf: &mut Vec<u8>) -> isize {
        let next = self.script().copy_reads.pop_front();
        self.sync();
        match next {
            Some(CopyRead::Line(line)) => {
                buf.clear();
                buf.extend_from_slice(line.as_bytes());
                buf.push(b'\n');
                buf.len() as isize
            }
            Some(CopyRead::Code(code)) => code,
            None => -1,
        }
    }

    fn copy_put_data(&mut self, data: &[u8]) -> i32 {
        let code = {
            let mut script = self.script();
            script.copy_writes.push(data.to_vec());
            script.put_data_codes.pop_front().unwrap_or(1)
        };
        self.sync();
        code
    }

    fn copy_put_end(&mut self, error: Option<&str>) -> i32 {
        let code = {
            let mut script = self.script();
            script.copy_end.push(error.map(str::to_string));
            script.put_end_codes.pop_front().unwrap_or(1)
        };
        self.sync();
        code
    }

    fn consume_input(&mut self) -> bool {
        let ok = !self.script().consume_fails;
        self.sync();
        ok
    }

    fn is_busy(&mut self) -> bool {
        !self.script().pending.is_empty()
    }

    fn next_notification(&mut self) -> Option<Notification> {
        self.script().notifications.pop_front()
    }

    fn socket(&self) -> Option<RawFd> {
        (self.script().status == ConnStatus::Ok).then_some(7)
    }

    fn wait_readable(&mut self, timeout: Duration) -> io::Result<bool> {
        let mut script = self.script();
        script.waits.push(timeout);
        let arrived: Vec<_> = script.arrive_on_wait.drain(..).collect();
        let any = !arrived.is_empty();
        script.notifications.extend(arrived);
        Ok(any)
    }

    fn set_notice_processor(&mut self, processor: Option<NoticeProcessor>) {
        self.script().notice_processor = processor;
        self.sync();
    }

    fn cancel_token(&self) -> Option<CancelToken> {
        None
    }

    fn finish(&mut self) {
        let mut script = self.script();
        script.status = ConnStatus::Bad;
        script.finished += 1;
    }
}
