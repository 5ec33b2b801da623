//! Command classification.
//!
//! The first payload byte of an authenticated-session unit names the
//! command. Unknown values are clamped to the [`Command::End`] sentinel
//! rather than rejected, so a newer client never crashes the proxy.
//! [`Command::dispatch`] decides what the pipeline does with each
//! command: answer it locally with a fixed OK, answer it locally with an
//! error, or forward it to a backend.

/// MySQL-shaped command byte, clamped to `End` for anything unknown.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    Sleep,
    Quit,
    InitDb,
    Query,
    FieldList,
    CreateDb,
    DropDb,
    Refresh,
    Shutdown,
    Statistics,
    ProcessInfo,
    Connect,
    ProcessKill,
    Debug,
    Ping,
    Time,
    DelayedInsert,
    ChangeUser,
    BinlogDump,
    TableDump,
    ConnectOut,
    RegisterSlave,
    StmtPrepare,
    StmtExecute,
    StmtSendLongData,
    StmtClose,
    StmtReset,
    SetOption,
    StmtFetch,
    Daemon,
    BinlogDumpGtid,
    ResetConnection,
    Clone,
    /// Explicit sentinel for out-of-range command bytes.
    End,
}

/// What the pipeline does with a parsed command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    /// Answer locally with a synthesized OK unit.
    ReplyOk,
    /// Answer locally with a synthesized error unit.
    ReplyError,
    /// Route to a backend helper.
    Forward,
}

impl Command {
    /// Classifies the first payload byte, clamping unknown values to `End`.
    pub fn from_byte(b: u8) -> Command {
        match b {
            0 => Command::Sleep,
            1 => Command::Quit,
            2 => Command::InitDb,
            3 => Command::Query,
            4 => Command::FieldList,
            5 => Command::CreateDb,
            6 => Command::DropDb,
            7 => Command::Refresh,
            8 => Command::Shutdown,
            9 => Command::Statistics,
            10 => Command::ProcessInfo,
            11 => Command::Connect,
            12 => Command::ProcessKill,
            13 => Command::Debug,
            14 => Command::Ping,
            15 => Command::Time,
            16 => Command::DelayedInsert,
            17 => Command::ChangeUser,
            18 => Command::BinlogDump,
            19 => Command::TableDump,
            20 => Command::ConnectOut,
            21 => Command::RegisterSlave,
            22 => Command::StmtPrepare,
            23 => Command::StmtExecute,
            24 => Command::StmtSendLongData,
            25 => Command::StmtClose,
            26 => Command::StmtReset,
            27 => Command::SetOption,
            28 => Command::StmtFetch,
            29 => Command::Daemon,
            30 => Command::BinlogDumpGtid,
            31 => Command::ResetConnection,
            32 => Command::Clone,
            _ => Command::End,
        }
    }

    /// How the pipeline handles this command.
    pub fn dispatch(self) -> Dispatch {
        match self {
            // session/bookkeeping commands the proxy acknowledges itself
            Command::InitDb
            | Command::RegisterSlave
            | Command::ResetConnection
            | Command::Clone
            | Command::ChangeUser
            | Command::FieldList
            | Command::Quit
            | Command::BinlogDumpGtid
            | Command::BinlogDump
            | Command::Refresh
            | Command::Statistics
            | Command::Ping
            | Command::ProcessInfo
            | Command::ProcessKill
            | Command::SetOption
            | Command::Debug => Dispatch::ReplyOk,

            // the cacheable/forwardable surface
            Command::Query | Command::StmtExecute | Command::StmtFetch => Dispatch::Forward,

            // prepared-statement lifecycle is not proxied, and the rest
            // cannot legitimately arrive from a client
            Command::StmtPrepare
            | Command::StmtClose
            | Command::StmtReset
            | Command::StmtSendLongData
            | Command::Sleep
            | Command::Connect
            | Command::Time
            | Command::DelayedInsert
            | Command::CreateDb
            | Command::DropDb
            | Command::Shutdown
            | Command::TableDump
            | Command::ConnectOut
            | Command::Daemon
            | Command::End => Dispatch::ReplyError,
        }
    }

    /// Forwarded commands that carry no key material of their own.
    ///
    /// These route by a synthetic per-request key instead of failing
    /// with a no-key error.
    pub fn routes_without_key(self) -> bool {
        matches!(self, Command::StmtExecute | Command::StmtFetch)
    }

    /// Short name for logs and counters.
    pub fn name(self) -> &'static str {
        match self {
            Command::Sleep => "sleep",
            Command::Quit => "quit",
            Command::InitDb => "init_db",
            Command::Query => "query",
            Command::FieldList => "field_list",
            Command::CreateDb => "create_db",
            Command::DropDb => "drop_db",
            Command::Refresh => "refresh",
            Command::Shutdown => "shutdown",
            Command::Statistics => "statistics",
            Command::ProcessInfo => "process_info",
            Command::Connect => "connect",
            Command::ProcessKill => "process_kill",
            Command::Debug => "debug",
            Command::Ping => "ping",
            Command::Time => "time",
            Command::DelayedInsert => "delayed_insert",
            Command::ChangeUser => "change_user",
            Command::BinlogDump => "binlog_dump",
            Command::TableDump => "table_dump",
            Command::ConnectOut => "connect_out",
            Command::RegisterSlave => "register_slave",
            Command::StmtPrepare => "stmt_prepare",
            Command::StmtExecute => "stmt_execute",
            Command::StmtSendLongData => "stmt_send_long_data",
            Command::StmtClose => "stmt_close",
            Command::StmtReset => "stmt_reset",
            Command::SetOption => "set_option",
            Command::StmtFetch => "stmt_fetch",
            Command::Daemon => "daemon",
            Command::BinlogDumpGtid => "binlog_dump_gtid",
            Command::ResetConnection => "reset_connection",
            Command::Clone => "clone",
            Command::End => "end",
        }
    }
}
