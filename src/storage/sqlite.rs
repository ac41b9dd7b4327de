// SQLite 存储实现：每次调用打开连接，WAL 模式，建表惰性执行一次。
use crate::storage::{
    BotSessionRecord, CheckInOutcome, ConversationMessageRecord, KeywordResourceRecord,
    PermissionRows, RoomRecord, StorageBackend,
};
use anyhow::{Context, Result};
use chrono::Utc;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};

pub struct SqliteStorage {
    db_path: PathBuf,
    initialized: AtomicBool,
    init_guard: Mutex<()>,
}

impl SqliteStorage {
    pub fn new(db_path: String) -> Self {
        let path = if db_path.trim().is_empty() {
            PathBuf::from("./data/wxhub.db")
        } else {
            PathBuf::from(db_path)
        };
        Self {
            db_path: path,
            initialized: AtomicBool::new(false),
            init_guard: Mutex::new(()),
        }
    }

    fn ensure_db_dir(&self) -> Result<()> {
        if let Some(parent) = self.db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("create db dir failed: {}", parent.display()))?;
            }
        }
        Ok(())
    }

    fn open(&self) -> Result<Connection> {
        self.ensure_db_dir()?;
        let conn = Connection::open(&self.db_path)
            .with_context(|| format!("open sqlite failed: {}", self.db_path.display()))?;
        conn.pragma_update(None, "journal_mode", "WAL").ok();
        conn.pragma_update(None, "synchronous", "NORMAL").ok();
        conn.busy_timeout(std::time::Duration::from_secs(5)).ok();
        Ok(conn)
    }

    fn now_ts() -> f64 {
        Utc::now().timestamp_millis() as f64 / 1000.0
    }

    fn session_from_row(row: &Row<'_>) -> rusqlite::Result<BotSessionRecord> {
        Ok(BotSessionRecord {
            wxid: row.get(0)?,
            nickname: row.get(1)?,
            host_id: row.get(2)?,
            client_slot: row.get(3)?,
            login_at: row.get(4)?,
            heartbeat_at: row.get(5)?,
            expires_at: row.get(6)?,
            created_at: row.get(7)?,
            updated_at: row.get(8)?,
        })
    }

    fn conversation_from_row(row: &Row<'_>) -> rusqlite::Result<ConversationMessageRecord> {
        Ok(ConversationMessageRecord {
            bot_wxid: row.get(0)?,
            room_wxid: row.get(1)?,
            peer_wxid: row.get(2)?,
            sender_wxid: row.get(3)?,
            event_id: row.get(4)?,
            origin_type: row.get(5)?,
            content: row.get(6)?,
            created_at: row.get(7)?,
        })
    }
}

const SESSION_COLUMNS: &str = "wxid, nickname, host_id, client_slot, login_at, heartbeat_at, \
     expires_at, created_at, updated_at";

impl StorageBackend for SqliteStorage {
    fn ensure_initialized(&self) -> Result<()> {
        if self.initialized.load(Ordering::SeqCst) {
            return Ok(());
        }
        let _guard = self.init_guard.lock();
        if self.initialized.load(Ordering::SeqCst) {
            return Ok(());
        }
        let conn = self.open()?;
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS bot_sessions (
              wxid TEXT PRIMARY KEY,
              nickname TEXT NOT NULL DEFAULT '',
              host_id TEXT NOT NULL,
              client_slot INTEGER,
              login_at REAL,
              heartbeat_at REAL,
              expires_at REAL,
              created_at REAL NOT NULL,
              updated_at REAL NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_bot_sessions_slot
              ON bot_sessions (host_id, client_slot);
            CREATE TABLE IF NOT EXISTS feature_globals (
              bot_wxid TEXT NOT NULL,
              feature TEXT NOT NULL,
              enabled INTEGER NOT NULL,
              updated_at REAL NOT NULL,
              PRIMARY KEY (bot_wxid, feature)
            );
            CREATE TABLE IF NOT EXISTS feature_overrides (
              bot_wxid TEXT NOT NULL,
              feature TEXT NOT NULL,
              scope_id TEXT NOT NULL,
              enabled INTEGER NOT NULL,
              updated_at REAL NOT NULL,
              PRIMARY KEY (bot_wxid, feature, scope_id)
            );
            CREATE TABLE IF NOT EXISTS rooms (
              bot_wxid TEXT NOT NULL,
              room_wxid TEXT NOT NULL,
              display_name TEXT,
              created_at REAL NOT NULL,
              updated_at REAL NOT NULL,
              PRIMARY KEY (bot_wxid, room_wxid)
            );
            CREATE TABLE IF NOT EXISTS conversation_messages (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              bot_wxid TEXT NOT NULL,
              room_wxid TEXT,
              peer_wxid TEXT NOT NULL,
              sender_wxid TEXT NOT NULL,
              event_id TEXT,
              origin_type TEXT,
              content TEXT NOT NULL,
              created_at REAL NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_conversation_room
              ON conversation_messages (bot_wxid, room_wxid, id);
            CREATE TABLE IF NOT EXISTS keyword_resources (
              keyword TEXT PRIMARY KEY,
              kind TEXT NOT NULL,
              content TEXT NOT NULL,
              updated_at REAL NOT NULL
            );
            CREATE TABLE IF NOT EXISTS keyword_subscriptions (
              bot_wxid TEXT NOT NULL,
              target TEXT NOT NULL,
              keyword TEXT NOT NULL,
              created_at REAL NOT NULL,
              PRIMARY KEY (bot_wxid, target, keyword)
            );
            CREATE TABLE IF NOT EXISTS check_ins (
              bot_wxid TEXT NOT NULL,
              room_wxid TEXT NOT NULL,
              member_wxid TEXT NOT NULL,
              day TEXT NOT NULL,
              created_at REAL NOT NULL,
              PRIMARY KEY (bot_wxid, room_wxid, member_wxid, day)
            );
            "#,
        )?;
        self.initialized.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn get_bot_session(&self, wxid: &str) -> Result<Option<BotSessionRecord>> {
        self.ensure_initialized()?;
        let conn = self.open()?;
        let record = conn
            .query_row(
                &format!("SELECT {SESSION_COLUMNS} FROM bot_sessions WHERE wxid = ?"),
                params![wxid.trim()],
                Self::session_from_row,
            )
            .optional()?;
        Ok(record)
    }

    fn get_bot_session_by_slot(
        &self,
        host_id: &str,
        client_slot: i64,
    ) -> Result<Option<BotSessionRecord>> {
        self.ensure_initialized()?;
        let conn = self.open()?;
        // 同一槽位可能残留旧账号，取最近一次心跳的那一行。
        let record = conn
            .query_row(
                &format!(
                    "SELECT {SESSION_COLUMNS} FROM bot_sessions \
                     WHERE host_id = ? AND client_slot = ? \
                     ORDER BY COALESCE(heartbeat_at, 0) DESC LIMIT 1"
                ),
                params![host_id.trim(), client_slot],
                Self::session_from_row,
            )
            .optional()?;
        Ok(record)
    }

    fn upsert_bot_session(&self, record: &BotSessionRecord) -> Result<()> {
        self.ensure_initialized()?;
        let conn = self.open()?;
        conn.execute(
            &format!(
                "INSERT INTO bot_sessions ({SESSION_COLUMNS}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?) \
                 ON CONFLICT(wxid) DO UPDATE SET nickname = excluded.nickname, \
                 host_id = excluded.host_id, client_slot = excluded.client_slot, \
                 login_at = excluded.login_at, heartbeat_at = excluded.heartbeat_at, \
                 expires_at = excluded.expires_at, updated_at = excluded.updated_at"
            ),
            params![
                record.wxid,
                record.nickname,
                record.host_id,
                record.client_slot,
                record.login_at,
                record.heartbeat_at,
                record.expires_at,
                record.created_at,
                record.updated_at,
            ],
        )?;
        Ok(())
    }

    fn clear_bot_session(&self, wxid: &str, now: f64) -> Result<usize> {
        self.ensure_initialized()?;
        let conn = self.open()?;
        let affected = conn.execute(
            "UPDATE bot_sessions SET client_slot = NULL, login_at = NULL, heartbeat_at = NULL, \
             updated_at = ? WHERE wxid = ?",
            params![now, wxid.trim()],
        )?;
        Ok(affected)
    }

    fn list_bot_sessions(&self) -> Result<Vec<BotSessionRecord>> {
        self.ensure_initialized()?;
        let conn = self.open()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {SESSION_COLUMNS} FROM bot_sessions ORDER BY created_at ASC"
        ))?;
        let rows = stmt
            .query_map([], Self::session_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    fn load_permissions(&self, bot_wxid: &str) -> Result<PermissionRows> {
        self.ensure_initialized()?;
        let conn = self.open()?;
        let mut stmt =
            conn.prepare("SELECT feature, enabled FROM feature_globals WHERE bot_wxid = ?")?;
        let globals = stmt
            .query_map(params![bot_wxid], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)? != 0))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        let mut stmt = conn.prepare(
            "SELECT feature, scope_id, enabled FROM feature_overrides WHERE bot_wxid = ?",
        )?;
        let overrides = stmt
            .query_map(params![bot_wxid], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, i64>(2)? != 0,
                ))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(PermissionRows { globals, overrides })
    }

    fn set_feature_global(&self, bot_wxid: &str, feature: &str, enabled: bool) -> Result<()> {
        self.ensure_initialized()?;
        let conn = self.open()?;
        conn.execute(
            "INSERT INTO feature_globals (bot_wxid, feature, enabled, updated_at) VALUES (?, ?, ?, ?) \
             ON CONFLICT(bot_wxid, feature) DO UPDATE SET enabled = excluded.enabled, \
             updated_at = excluded.updated_at",
            params![bot_wxid, feature, enabled as i64, Self::now_ts()],
        )?;
        Ok(())
    }

    fn set_feature_override(
        &self,
        bot_wxid: &str,
        feature: &str,
        scope_id: &str,
        enabled: Option<bool>,
    ) -> Result<()> {
        self.ensure_initialized()?;
        let conn = self.open()?;
        match enabled {
            Some(enabled) => {
                conn.execute(
                    "INSERT INTO feature_overrides (bot_wxid, feature, scope_id, enabled, updated_at) \
                     VALUES (?, ?, ?, ?, ?) \
                     ON CONFLICT(bot_wxid, feature, scope_id) DO UPDATE SET \
                     enabled = excluded.enabled, updated_at = excluded.updated_at",
                    params![bot_wxid, feature, scope_id, enabled as i64, Self::now_ts()],
                )?;
            }
            None => {
                conn.execute(
                    "DELETE FROM feature_overrides WHERE bot_wxid = ? AND feature = ? AND scope_id = ?",
                    params![bot_wxid, feature, scope_id],
                )?;
            }
        }
        Ok(())
    }

    fn ensure_room(&self, bot_wxid: &str, room_wxid: &str) -> Result<bool> {
        self.ensure_initialized()?;
        let conn = self.open()?;
        let now = Self::now_ts();
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO rooms (bot_wxid, room_wxid, display_name, created_at, updated_at) \
             VALUES (?, ?, NULL, ?, ?)",
            params![bot_wxid, room_wxid, now, now],
        )?;
        Ok(inserted > 0)
    }

    fn set_room_display_name(&self, bot_wxid: &str, room_wxid: &str, name: &str) -> Result<()> {
        self.ensure_initialized()?;
        let conn = self.open()?;
        let now = Self::now_ts();
        conn.execute(
            "INSERT INTO rooms (bot_wxid, room_wxid, display_name, created_at, updated_at) \
             VALUES (?, ?, ?, ?, ?) \
             ON CONFLICT(bot_wxid, room_wxid) DO UPDATE SET display_name = excluded.display_name, \
             updated_at = excluded.updated_at",
            params![bot_wxid, room_wxid, name, now, now],
        )?;
        Ok(())
    }

    fn get_room(&self, bot_wxid: &str, room_wxid: &str) -> Result<Option<RoomRecord>> {
        self.ensure_initialized()?;
        let conn = self.open()?;
        let record = conn
            .query_row(
                "SELECT bot_wxid, room_wxid, display_name, created_at, updated_at FROM rooms \
                 WHERE bot_wxid = ? AND room_wxid = ?",
                params![bot_wxid, room_wxid],
                |row| {
                    Ok(RoomRecord {
                        bot_wxid: row.get(0)?,
                        room_wxid: row.get(1)?,
                        display_name: row.get(2)?,
                        created_at: row.get(3)?,
                        updated_at: row.get(4)?,
                    })
                },
            )
            .optional()?;
        Ok(record)
    }

    fn insert_conversation_message(&self, record: &ConversationMessageRecord) -> Result<()> {
        self.ensure_initialized()?;
        let conn = self.open()?;
        conn.execute(
            "INSERT INTO conversation_messages (bot_wxid, room_wxid, peer_wxid, sender_wxid, \
             event_id, origin_type, content, created_at) VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
            params![
                record.bot_wxid,
                record.room_wxid,
                record.peer_wxid,
                record.sender_wxid,
                record.event_id,
                record.origin_type,
                record.content,
                record.created_at,
            ],
        )?;
        Ok(())
    }

    fn list_conversation_messages(
        &self,
        bot_wxid: &str,
        room_wxid: &str,
        limit: i64,
    ) -> Result<Vec<ConversationMessageRecord>> {
        self.ensure_initialized()?;
        let conn = self.open()?;
        let mut stmt = conn.prepare(
            "SELECT bot_wxid, room_wxid, peer_wxid, sender_wxid, event_id, origin_type, content, \
             created_at FROM conversation_messages WHERE bot_wxid = ? AND room_wxid = ? \
             ORDER BY id DESC LIMIT ?",
        )?;
        let mut rows = stmt
            .query_map(
                params![bot_wxid, room_wxid, limit.max(1)],
                Self::conversation_from_row,
            )?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        rows.reverse();
        Ok(rows)
    }

    fn delete_conversation_messages_by_room(
        &self,
        bot_wxid: &str,
        room_wxid: &str,
    ) -> Result<i64> {
        self.ensure_initialized()?;
        let conn = self.open()?;
        let affected = conn.execute(
            "DELETE FROM conversation_messages WHERE bot_wxid = ? AND room_wxid = ?",
            params![bot_wxid, room_wxid],
        )?;
        Ok(affected as i64)
    }

    fn get_keyword_resource(&self, keyword: &str) -> Result<Option<KeywordResourceRecord>> {
        self.ensure_initialized()?;
        let conn = self.open()?;
        let record = conn
            .query_row(
                "SELECT keyword, kind, content, updated_at FROM keyword_resources WHERE keyword = ?",
                params![keyword.trim()],
                |row| {
                    Ok(KeywordResourceRecord {
                        keyword: row.get(0)?,
                        kind: row.get(1)?,
                        content: row.get(2)?,
                        updated_at: row.get(3)?,
                    })
                },
            )
            .optional()?;
        Ok(record)
    }

    fn upsert_keyword_resource(&self, record: &KeywordResourceRecord) -> Result<()> {
        self.ensure_initialized()?;
        let conn = self.open()?;
        conn.execute(
            "INSERT INTO keyword_resources (keyword, kind, content, updated_at) VALUES (?, ?, ?, ?) \
             ON CONFLICT(keyword) DO UPDATE SET kind = excluded.kind, content = excluded.content, \
             updated_at = excluded.updated_at",
            params![
                record.keyword.trim(),
                record.kind,
                record.content,
                record.updated_at
            ],
        )?;
        Ok(())
    }

    fn add_subscription(&self, bot_wxid: &str, target: &str, keyword: &str) -> Result<bool> {
        self.ensure_initialized()?;
        let conn = self.open()?;
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO keyword_subscriptions (bot_wxid, target, keyword, created_at) \
             VALUES (?, ?, ?, ?)",
            params![bot_wxid, target, keyword, Self::now_ts()],
        )?;
        Ok(inserted > 0)
    }

    fn remove_subscription(&self, bot_wxid: &str, target: &str, keyword: &str) -> Result<bool> {
        self.ensure_initialized()?;
        let conn = self.open()?;
        let removed = conn.execute(
            "DELETE FROM keyword_subscriptions WHERE bot_wxid = ? AND target = ? AND keyword = ?",
            params![bot_wxid, target, keyword],
        )?;
        Ok(removed > 0)
    }

    fn list_subscriptions(&self, bot_wxid: &str, target: &str) -> Result<Vec<String>> {
        self.ensure_initialized()?;
        let conn = self.open()?;
        let mut stmt = conn.prepare(
            "SELECT keyword FROM keyword_subscriptions WHERE bot_wxid = ? AND target = ? \
             ORDER BY created_at ASC",
        )?;
        let rows = stmt
            .query_map(params![bot_wxid, target], |row| row.get::<_, String>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    fn record_check_in(
        &self,
        bot_wxid: &str,
        room_wxid: &str,
        member_wxid: &str,
        day: &str,
    ) -> Result<CheckInOutcome> {
        self.ensure_initialized()?;
        let conn = self.open()?;
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO check_ins (bot_wxid, room_wxid, member_wxid, day, created_at) \
             VALUES (?, ?, ?, ?, ?)",
            params![bot_wxid, room_wxid, member_wxid, day, Self::now_ts()],
        )?;
        // 按插入顺序排名，同一毫秒内的签到也能区分先后。
        let rank: i64 = conn.query_row(
            "SELECT COUNT(*) FROM check_ins WHERE bot_wxid = ? AND room_wxid = ? AND day = ? \
             AND rowid <= (SELECT rowid FROM check_ins WHERE bot_wxid = ? \
             AND room_wxid = ? AND member_wxid = ? AND day = ?)",
            params![bot_wxid, room_wxid, day, bot_wxid, room_wxid, member_wxid, day],
            |row| row.get(0),
        )?;
        Ok(CheckInOutcome {
            inserted: inserted > 0,
            rank,
        })
    }
}
