//! The SQLite-backed leasequery store.
//!
//! SQLite has no native IPv6 types, so addresses are stored as their fully
//! expanded lower-case text form (`2001:db8::1` becomes
//! `2001:0db8:0000:0000:0000:0000:0000:0001`). Delegated prefixes are stored
//! as their first and last covered address, which turns "is this address in
//! a delegated prefix" into a plain
//! `WHERE ? BETWEEN first_address AND last_address`. DUIDs and remote-ids
//! are lower-case hex. Lifetimes are stored as absolute UNIX deadlines.
//!
//! The schema is prepared by the supervisor; each worker opens its own
//! connection in `worker_init`. The database runs in WAL mode and every
//! write batch uses an IMMEDIATE transaction, so readers and writers do not
//! block each other.

use std::net::Ipv6Addr;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use log::{debug, error, info};

use rusqlite::{params, Connection, OpenFlags, TransactionBehavior};

use sedge_proto::message::MessageType;
use sedge_proto::options::leasequery::QueryType;
use sedge_proto::options::{
    ia::is_accepted, ClientDataOption, DhcpOption, IaAddressOption, IaPrefixOption, LqQueryOption,
    OPTION_LQ_RELAY_DATA,
};
use sedge_proto::Duid;

use crate::bundle::TransactionBundle;
use crate::leasequery::{
    decode_options, encode_options, encode_relay_messages, filter_options, relay_data_option,
    relay_ids, remote_ids, FindError, LeaseResult, LeasequeryStore,
};
use crate::ServerError;

const SCHEMA_VERSION: i64 = 1;

pub struct SqliteLeasequeryStore {
    path: PathBuf,
    db: Option<Connection>,
    sensitive_options: Vec<u16>,
}

impl SqliteLeasequeryStore {
    /// Make sure the database file and schema exist. The per-worker
    /// connection is opened later in `worker_init`.
    pub fn new(path: &Path) -> Result<Self, ServerError> {
        let store = Self {
            path: path.to_path_buf(),
            db: None,
            sensitive_options: Vec::new(),
        };

        let mut db = store.open_database()?;
        create_tables(&mut db)?;
        db.close().map_err(|(_, e)| ServerError::from(e))?;

        Ok(store)
    }

    /// One-time startup housekeeping, run by the supervisor before the
    /// workers build their pipelines: create the schema, drop expired rows
    /// and compact the file.
    pub fn prepare(path: &Path) -> Result<(), ServerError> {
        let store = Self {
            path: path.to_path_buf(),
            db: None,
            sensitive_options: Vec::new(),
        };

        let mut db = store.open_database()?;
        create_tables(&mut db)?;
        cleanup_expired(&mut db)?;
        db.close().map_err(|(_, e)| ServerError::from(e))?;

        Ok(())
    }

    fn open_database(&self) -> Result<Connection, rusqlite::Error> {
        info!("Opening leasequery database {}", self.path.display());

        let db = Connection::open_with_flags(
            &self.path,
            OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_CREATE,
        )?;
        let _mode: String = db.query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))?;
        db.pragma_update(None, "foreign_keys", "ON")?;
        // workers may open and migrate concurrently at startup
        db.busy_timeout(std::time::Duration::from_secs(5))?;

        Ok(db)
    }

    fn db(&mut self) -> Result<&mut Connection, FindError> {
        self.db.as_mut().ok_or(FindError::NotReady)
    }
}

impl LeasequeryStore for SqliteLeasequeryStore {
    fn worker_init(&mut self, sensitive_options: &[u16]) -> Result<(), ServerError> {
        self.sensitive_options = sensitive_options.to_vec();
        self.db = Some(self.open_database()?);

        Ok(())
    }

    fn remember_lease(&mut self, bundle: &TransactionBundle) -> Result<(), ServerError> {
        let Some(request) = &bundle.request else {
            return Ok(());
        };
        let Some(response) = &bundle.response else {
            return Ok(());
        };
        let Some(client_duid) = request.client_id() else {
            return Ok(());
        };

        let client_id = client_duid.hex();
        let link_address = exploded(&bundle.link_address());

        // Only lease-changing exchanges with an accepting answer update the
        // recorded assignments
        let mut address_leases: Vec<IaAddressOption> = Vec::new();
        let mut prefix_leases: Vec<IaPrefixOption> = Vec::new();
        if matches!(
            request.message_type,
            MessageType::Solicit | MessageType::Request | MessageType::Renew | MessageType::Rebind
        ) && is_accepted(response.status_code())
        {
            for option in &response.options {
                match option {
                    DhcpOption::IaNa(ia) if is_accepted(ia.status_code()) => {
                        address_leases.extend(ia.addresses().cloned());
                    }
                    DhcpOption::IaTa(ia) if is_accepted(ia.status_code()) => {
                        address_leases.extend(ia.addresses().cloned());
                    }
                    DhcpOption::IaPd(ia) if is_accepted(ia.status_code()) => {
                        prefix_leases.extend(ia.prefixes().cloned());
                    }
                    _ => {}
                }
            }
        }

        let interesting = !address_leases.is_empty() || !prefix_leases.is_empty();

        let sensitive = self.sensitive_options.clone();
        let options_blob = encode_options(&response.options, &sensitive);
        let relay_blob = encode_relay_messages(&bundle.incoming_relay_messages, &sensitive);
        let new_remote_ids = remote_ids(bundle);
        let new_relay_ids = relay_ids(bundle);

        let db = self
            .db
            .as_mut()
            .ok_or_else(|| ServerError::config("leasequery store used before worker_init"))?;

        let tx = db.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let now = unix_now();

        let Some(client_row_id) = client_row_id(&tx, &client_id, &link_address, interesting)?
        else {
            return Ok(());
        };

        tx.execute(
            "UPDATE clients SET last_interaction=?, options=?, relay_data=? WHERE id=?",
            params![now, options_blob, relay_blob, client_row_id],
        )?;

        replace_id_set(&tx, "remote_ids", "remote_id", client_row_id, &new_remote_ids)?;
        replace_id_set(&tx, "relay_ids", "relay_id", client_row_id, &new_relay_ids)?;

        update_address_leases(&tx, client_row_id, &address_leases, &sensitive, now)?;
        update_prefix_leases(&tx, client_row_id, &prefix_leases, &sensitive, now)?;

        tx.commit()?;

        Ok(())
    }

    fn find_leases(&mut self, query: &LqQueryOption) -> Result<LeaseResult, FindError> {
        let sensitive = self.sensitive_options.clone();
        let db = self.db()?;

        let client_row_ids = match query.known_query_type() {
            Some(QueryType::ByAddress) => find_client_by_address(db, query)?,
            Some(QueryType::ByClientId) => find_client_by_client_id(db, query)?,
            Some(QueryType::ByRelayId) => find_client_by_relay_id(db, query)?,
            Some(QueryType::ByLinkAddress) => find_client_by_link_address(db, query)?,
            Some(QueryType::ByRemoteId) => find_client_by_remote_id(db, query)?,
            None => return Ok(LeaseResult { count: -1, leases: Vec::new() }),
        };

        if client_row_ids.is_empty() {
            return Ok(LeaseResult { count: 0, leases: Vec::new() });
        }

        let requested_options: Vec<u16> = query
            .options
            .iter()
            .find_map(|option| match option {
                DhcpOption::OptionRequest(codes) => Some(codes.clone()),
                _ => None,
            })
            .unwrap_or_default();

        let leases = generate_client_data(db, &client_row_ids, &requested_options, &sensitive)?;

        Ok(LeaseResult {
            count: client_row_ids.len() as i64,
            leases,
        })
    }
}

/// The fully expanded lower-case text form used throughout the schema.
pub fn exploded(address: &Ipv6Addr) -> String {
    let segments = address.segments();
    format!(
        "{:04x}:{:04x}:{:04x}:{:04x}:{:04x}:{:04x}:{:04x}:{:04x}",
        segments[0],
        segments[1],
        segments[2],
        segments[3],
        segments[4],
        segments[5],
        segments[6],
        segments[7]
    )
}

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_secs() as i64)
        .unwrap_or(0)
}

fn create_tables(db: &mut Connection) -> Result<(), rusqlite::Error> {
    let tx = db.transaction_with_behavior(TransactionBehavior::Immediate)?;

    let current_version: i64 = tx.query_row("PRAGMA user_version", [], |row| row.get(0))?;
    if current_version < SCHEMA_VERSION {
        debug!("Creating leasequery database tables where necessary");
    }

    tx.execute_batch(
        "CREATE TABLE IF NOT EXISTS clients (
             id INTEGER NOT NULL PRIMARY KEY AUTOINCREMENT,
             client_id TEXT NOT NULL,
             link_address TEXT NOT NULL,
             options BLOB NOT NULL DEFAULT '',
             last_interaction INTEGER NOT NULL DEFAULT -1,
             relay_data BLOB NOT NULL DEFAULT '',
             UNIQUE (client_id, link_address)
         );
         CREATE INDEX IF NOT EXISTS clients_client_id ON clients(client_id, link_address);
         CREATE INDEX IF NOT EXISTS clients_link_address ON clients(link_address);

         CREATE TABLE IF NOT EXISTS addresses (
             client_fk INTEGER NOT NULL REFERENCES clients(id) ON DELETE CASCADE,
             address TEXT NOT NULL,
             preferred_lifetime_end INTEGER NOT NULL DEFAULT -1,
             valid_lifetime_end INTEGER NOT NULL DEFAULT -1,
             options BLOB NOT NULL DEFAULT '',
             UNIQUE (client_fk, address)
         );
         CREATE INDEX IF NOT EXISTS addresses_address ON addresses(address);
         CREATE INDEX IF NOT EXISTS addresses_client_fk ON addresses(client_fk);

         CREATE TABLE IF NOT EXISTS prefixes (
             client_fk INTEGER NOT NULL REFERENCES clients(id) ON DELETE CASCADE,
             first_address TEXT NOT NULL,
             last_address TEXT NOT NULL,
             preferred_lifetime_end INTEGER NOT NULL DEFAULT -1,
             valid_lifetime_end INTEGER NOT NULL DEFAULT -1,
             options BLOB NOT NULL DEFAULT '',
             UNIQUE (client_fk, first_address, last_address)
         );
         CREATE INDEX IF NOT EXISTS prefixes_range ON prefixes(first_address, last_address);
         CREATE INDEX IF NOT EXISTS prefixes_client_fk ON prefixes(client_fk);

         CREATE TABLE IF NOT EXISTS remote_ids (
             client_fk INTEGER NOT NULL REFERENCES clients(id) ON DELETE CASCADE,
             remote_id TEXT NOT NULL,
             UNIQUE (client_fk, remote_id)
         );
         CREATE INDEX IF NOT EXISTS remote_ids_remote_id ON remote_ids(remote_id);
         CREATE INDEX IF NOT EXISTS remote_ids_client_fk ON remote_ids(client_fk);

         CREATE TABLE IF NOT EXISTS relay_ids (
             client_fk INTEGER NOT NULL REFERENCES clients(id) ON DELETE CASCADE,
             relay_id TEXT NOT NULL,
             UNIQUE (client_fk, relay_id)
         );
         CREATE INDEX IF NOT EXISTS relay_ids_relay_id ON relay_ids(relay_id);
         CREATE INDEX IF NOT EXISTS relay_ids_client_fk ON relay_ids(client_fk);",
    )?;

    tx.pragma_update(None, "user_version", SCHEMA_VERSION)?;
    tx.commit()
}

/// Startup housekeeping: drop fully expired rows and clients that no longer
/// hold anything, then compact.
fn cleanup_expired(db: &mut Connection) -> Result<(), rusqlite::Error> {
    debug!("Cleaning up old records from the lease database");
    let now = unix_now();

    let tx = db.transaction_with_behavior(TransactionBehavior::Immediate)?;
    tx.execute(
        "DELETE FROM addresses WHERE preferred_lifetime_end<? AND valid_lifetime_end<?",
        params![now, now],
    )?;
    tx.execute(
        "DELETE FROM prefixes WHERE preferred_lifetime_end<? AND valid_lifetime_end<?",
        params![now, now],
    )?;
    tx.execute(
        "DELETE FROM clients
         WHERE NOT EXISTS(SELECT 1 FROM addresses WHERE client_fk=clients.id)
           AND NOT EXISTS(SELECT 1 FROM prefixes WHERE client_fk=clients.id)",
        [],
    )?;
    tx.commit()?;

    db.execute_batch("VACUUM")
}

/// The row id for this client on this link, creating the row when the
/// observation is worth recording.
fn client_row_id(
    tx: &Connection,
    client_id: &str,
    link_address: &str,
    create: bool,
) -> Result<Option<i64>, rusqlite::Error> {
    if create {
        tx.execute(
            "INSERT OR IGNORE INTO clients(client_id, link_address) VALUES (?, ?)",
            params![client_id, link_address],
        )?;
    }

    tx.query_row(
        "SELECT id FROM clients WHERE client_id=? AND link_address=?",
        params![client_id, link_address],
        |row| row.get(0),
    )
    .map(Some)
    .or_else(|e| match e {
        rusqlite::Error::QueryReturnedNoRows => Ok(None),
        other => Err(other),
    })
}

/// Make the stored id set for a client equal to `wanted`: delete what is no
/// longer seen, insert what is new, leave the rest alone.
fn replace_id_set(
    tx: &Connection,
    table: &str,
    column: &str,
    client_row_id: i64,
    wanted: &[String],
) -> Result<(), rusqlite::Error> {
    let mut missing: Vec<&String> = wanted.iter().collect();

    let mut stmt = tx.prepare(&format!(
        "SELECT {column} FROM {table} WHERE client_fk=?"
    ))?;
    let existing: Vec<String> = stmt
        .query_map(params![client_row_id], |row| row.get(0))?
        .collect::<Result<_, _>>()?;

    for value in existing {
        if let Some(position) = missing.iter().position(|wanted| **wanted == value) {
            missing.remove(position);
        } else {
            tx.execute(
                &format!("DELETE FROM {table} WHERE client_fk=? AND {column}=?"),
                params![client_row_id, value],
            )?;
        }
    }

    for value in missing {
        tx.execute(
            &format!("INSERT OR IGNORE INTO {table} (client_fk, {column}) VALUES (?, ?)"),
            params![client_row_id, value],
        )?;
    }

    Ok(())
}

fn update_address_leases(
    tx: &Connection,
    client_row_id: i64,
    leases: &[IaAddressOption],
    sensitive: &[u16],
    now: i64,
) -> Result<(), rusqlite::Error> {
    let mut new_leases: Vec<(String, &IaAddressOption)> = leases
        .iter()
        .map(|lease| (exploded(&lease.address), lease))
        .collect();

    // A newer observation overrides the same address held by another client
    for (address, _) in &new_leases {
        tx.execute(
            "DELETE FROM addresses WHERE address=? AND client_fk<>?",
            params![address, client_row_id],
        )?;
    }

    let mut stmt = tx.prepare("SELECT address FROM addresses WHERE client_fk=?")?;
    let existing: Vec<String> = stmt
        .query_map(params![client_row_id], |row| row.get(0))?
        .collect::<Result<_, _>>()?;

    for address in existing {
        if let Some(position) = new_leases.iter().position(|(key, _)| *key == address) {
            let (_, lease) = new_leases.remove(position);
            tx.execute(
                "UPDATE addresses SET preferred_lifetime_end=?, valid_lifetime_end=?, options=?
                 WHERE client_fk=? AND address=?",
                params![
                    now + i64::from(lease.preferred_lifetime),
                    now + i64::from(lease.valid_lifetime),
                    encode_options(&lease.options, sensitive),
                    client_row_id,
                    address
                ],
            )?;
        }
    }

    for (address, lease) in new_leases {
        tx.execute(
            "INSERT OR IGNORE INTO addresses
             (client_fk, address, preferred_lifetime_end, valid_lifetime_end, options)
             VALUES (?, ?, ?, ?, ?)",
            params![
                client_row_id,
                address,
                now + i64::from(lease.preferred_lifetime),
                now + i64::from(lease.valid_lifetime),
                encode_options(&lease.options, sensitive)
            ],
        )?;
    }

    tx.execute(
        "DELETE FROM addresses WHERE client_fk=? AND valid_lifetime_end<?",
        params![client_row_id, now],
    )?;

    Ok(())
}

fn update_prefix_leases(
    tx: &Connection,
    client_row_id: i64,
    leases: &[IaPrefixOption],
    sensitive: &[u16],
    now: i64,
) -> Result<(), rusqlite::Error> {
    let mut new_leases: Vec<((String, String), &IaPrefixOption)> = leases
        .iter()
        .map(|lease| {
            (
                (
                    exploded(&lease.first_address()),
                    exploded(&lease.last_address()),
                ),
                lease,
            )
        })
        .collect();

    // Overlapping delegations to other clients are superseded by this one
    for ((first, last), _) in &new_leases {
        tx.execute(
            "DELETE FROM prefixes WHERE first_address<=? AND last_address>=? AND client_fk<>?",
            params![last, first, client_row_id],
        )?;
    }

    let mut stmt =
        tx.prepare("SELECT first_address, last_address FROM prefixes WHERE client_fk=?")?;
    let existing: Vec<(String, String)> = stmt
        .query_map(params![client_row_id], |row| {
            Ok((row.get(0)?, row.get(1)?))
        })?
        .collect::<Result<_, _>>()?;

    for range in existing {
        if let Some(position) = new_leases.iter().position(|(key, _)| *key == range) {
            let (_, lease) = new_leases.remove(position);
            tx.execute(
                "UPDATE prefixes SET preferred_lifetime_end=?, valid_lifetime_end=?, options=?
                 WHERE client_fk=? AND first_address=? AND last_address=?",
                params![
                    now + i64::from(lease.preferred_lifetime),
                    now + i64::from(lease.valid_lifetime),
                    encode_options(&lease.options, sensitive),
                    client_row_id,
                    range.0,
                    range.1
                ],
            )?;
        }
    }

    for ((first, last), lease) in new_leases {
        tx.execute(
            "INSERT OR IGNORE INTO prefixes
             (client_fk, first_address, last_address,
              preferred_lifetime_end, valid_lifetime_end, options)
             VALUES (?, ?, ?, ?, ?, ?)",
            params![
                client_row_id,
                first,
                last,
                now + i64::from(lease.preferred_lifetime),
                now + i64::from(lease.valid_lifetime),
                encode_options(&lease.options, sensitive)
            ],
        )?;
    }

    tx.execute(
        "DELETE FROM prefixes WHERE client_fk=? AND valid_lifetime_end<?",
        params![client_row_id, now],
    )?;

    Ok(())
}

fn find_client_by_address(
    db: &Connection,
    query: &LqQueryOption,
) -> Result<Vec<i64>, FindError> {
    let address = query
        .options
        .iter()
        .find_map(|option| match option {
            DhcpOption::IaAddress(addr) => Some(addr.address),
            _ => None,
        })
        .ok_or_else(|| FindError::Malformed("Address queries must contain an address".into()))?;
    let address = exploded(&address);

    let rows = if query.link_address.is_unspecified() {
        collect_ids(
            db,
            "SELECT client_fk FROM addresses WHERE address=?1
             UNION
             SELECT client_fk FROM prefixes WHERE ?1 BETWEEN first_address AND last_address",
            params![address],
        )?
    } else {
        collect_ids(
            db,
            "SELECT id FROM clients WHERE link_address=?1 AND (
                 id IN (SELECT client_fk FROM addresses WHERE address=?2)
                 OR
                 id IN (SELECT client_fk FROM prefixes
                        WHERE ?2 BETWEEN first_address AND last_address)
             )",
            params![exploded(&query.link_address), address],
        )?
    };

    Ok(rows)
}

fn find_client_by_client_id(
    db: &Connection,
    query: &LqQueryOption,
) -> Result<Vec<i64>, FindError> {
    let duid = query
        .options
        .iter()
        .find_map(|option| match option {
            DhcpOption::ClientId(duid) => Some(duid),
            _ => None,
        })
        .ok_or_else(|| FindError::Malformed("Client-ID queries must contain a client ID".into()))?;

    let rows = if query.link_address.is_unspecified() {
        collect_ids(db, "SELECT id FROM clients WHERE client_id=?", params![duid.hex()])?
    } else {
        collect_ids(
            db,
            "SELECT id FROM clients WHERE client_id=? AND link_address=?",
            params![duid.hex(), exploded(&query.link_address)],
        )?
    };

    Ok(rows)
}

fn find_client_by_relay_id(db: &Connection, query: &LqQueryOption) -> Result<Vec<i64>, FindError> {
    let duid = query
        .options
        .iter()
        .find_map(|option| match option {
            DhcpOption::RelayId(duid) => Some(duid),
            _ => None,
        })
        .ok_or_else(|| FindError::Malformed("Relay-ID queries must contain a relay ID".into()))?;

    let rows = if query.link_address.is_unspecified() {
        collect_ids(
            db,
            "SELECT client_fk FROM relay_ids WHERE relay_id=?",
            params![duid.hex()],
        )?
    } else {
        collect_ids(
            db,
            "SELECT id FROM clients
             WHERE link_address=? AND id IN (SELECT client_fk FROM relay_ids WHERE relay_id=?)",
            params![exploded(&query.link_address), duid.hex()],
        )?
    };

    Ok(rows)
}

fn find_client_by_link_address(
    db: &Connection,
    query: &LqQueryOption,
) -> Result<Vec<i64>, FindError> {
    let rows = if query.link_address.is_unspecified() {
        // an unspecified link means every lease we know about
        collect_ids(db, "SELECT id FROM clients", [])?
    } else {
        collect_ids(
            db,
            "SELECT id FROM clients WHERE link_address=?",
            params![exploded(&query.link_address)],
        )?
    };

    Ok(rows)
}

fn find_client_by_remote_id(
    db: &Connection,
    query: &LqQueryOption,
) -> Result<Vec<i64>, FindError> {
    let remote_id = query
        .options
        .iter()
        .find_map(|option| match option {
            DhcpOption::RemoteId(remote) => Some(remote.identity()),
            _ => None,
        })
        .ok_or_else(|| FindError::Malformed("Remote-ID queries must contain a remote ID".into()))?;

    let rows = if query.link_address.is_unspecified() {
        collect_ids(
            db,
            "SELECT client_fk FROM remote_ids WHERE remote_id=?",
            params![remote_id],
        )?
    } else {
        collect_ids(
            db,
            "SELECT id FROM clients
             WHERE link_address=? AND id IN (SELECT client_fk FROM remote_ids WHERE remote_id=?)",
            params![exploded(&query.link_address), remote_id],
        )?
    };

    Ok(rows)
}

fn collect_ids(
    db: &Connection,
    sql: &str,
    params: impl rusqlite::Params,
) -> Result<Vec<i64>, rusqlite::Error> {
    let mut stmt = db.prepare(sql)?;
    let ids = stmt
        .query_map(params, |row| row.get(0))?
        .collect::<Result<Vec<i64>, _>>()?;

    Ok(ids)
}

fn generate_client_data(
    db: &Connection,
    client_row_ids: &[i64],
    requested_options: &[u16],
    sensitive: &[u16],
) -> Result<Vec<(Ipv6Addr, ClientDataOption)>, FindError> {
    let relay_data_requested = requested_options.contains(&OPTION_LQ_RELAY_DATA);
    let now = unix_now();

    let mut results = Vec::with_capacity(client_row_ids.len());

    for client_row_id in client_row_ids {
        let (client_id, link_address, last_interaction, options_blob, relay_blob) = db.query_row(
            "SELECT client_id, link_address, last_interaction, options, relay_data
             FROM clients WHERE id=?",
            params![client_row_id],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, i64>(2)?,
                    row.get::<_, Vec<u8>>(3)?,
                    row.get::<_, Vec<u8>>(4)?,
                ))
            },
        )?;

        let link_address: Ipv6Addr = link_address.parse().unwrap_or(Ipv6Addr::UNSPECIFIED);

        let duid = match Duid::from_hex(&client_id) {
            Ok(duid) => duid,
            Err(e) => {
                error!("Ignoring corrupt client id in lease database: {}", e);
                continue;
            }
        };

        let mut options: Vec<DhcpOption> = vec![
            DhcpOption::ClientId(duid),
            DhcpOption::CltTime((now - last_interaction).max(0) as u32),
        ];

        // Stored options only come back when explicitly requested
        if !requested_options.is_empty() {
            if let Ok(stored) = decode_options(&options_blob) {
                let stored = filter_options(&stored, sensitive);
                options.extend(
                    stored
                        .into_iter()
                        .filter(|option| requested_options.contains(&option.code())),
                );
            }
        }

        if relay_data_requested {
            if let Some(relay_data) = relay_data_option(&relay_blob) {
                options.push(DhcpOption::LqRelayData(relay_data));
            }
        }

        let mut stmt = db.prepare(
            "SELECT address, preferred_lifetime_end, valid_lifetime_end, options
             FROM addresses WHERE client_fk=? AND valid_lifetime_end>?",
        )?;
        let address_rows = stmt.query_map(params![client_row_id, now], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, i64>(2)?,
                row.get::<_, Vec<u8>>(3)?,
            ))
        })?;

        for row in address_rows {
            let (address, preferred_end, valid_end, blob) = row?;
            let Ok(address) = address.parse::<Ipv6Addr>() else {
                error!("Ignoring invalid address in lease database: {}", address);
                continue;
            };

            let mut lease = IaAddressOption::new(
                address,
                (preferred_end - now).max(0) as u32,
                (valid_end - now).max(0) as u32,
            );
            lease.options = decode_options(&blob).unwrap_or_default();
            options.push(DhcpOption::IaAddress(lease));
        }

        let mut stmt = db.prepare(
            "SELECT first_address, last_address, preferred_lifetime_end, valid_lifetime_end,
                    options
             FROM prefixes WHERE client_fk=? AND valid_lifetime_end>?",
        )?;
        let prefix_rows = stmt.query_map(params![client_row_id, now], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, i64>(2)?,
                row.get::<_, i64>(3)?,
                row.get::<_, Vec<u8>>(4)?,
            ))
        })?;

        for row in prefix_rows {
            let (first, last, preferred_end, valid_end, blob) = row?;
            let Some((prefix, prefix_length)) = range_to_prefix(&first, &last) else {
                error!(
                    "Ignoring invalid prefix range in lease database: {} - {}",
                    first, last
                );
                continue;
            };

            let mut lease = IaPrefixOption::new(
                prefix,
                prefix_length,
                (preferred_end - now).max(0) as u32,
                (valid_end - now).max(0) as u32,
            );
            lease.options = decode_options(&blob).unwrap_or_default();
            options.push(DhcpOption::IaPrefix(lease));
        }

        results.push((link_address, ClientDataOption::new(options)));
    }

    Ok(results)
}

/// Reconstruct `prefix/len` from a stored `[first, last]` range. Returns
/// `None` when the range is not exactly one prefix.
fn range_to_prefix(first: &str, last: &str) -> Option<(Ipv6Addr, u8)> {
    let first: Ipv6Addr = first.parse().ok()?;
    let last: Ipv6Addr = last.parse().ok()?;

    let first_bits = u128::from(first);
    let last_bits = u128::from(last);
    if first_bits > last_bits {
        return None;
    }

    let span = first_bits ^ last_bits;
    // the differing bits must be one contiguous all-ones suffix aligned to
    // the first address
    if span & span.wrapping_add(1) != 0 || first_bits & span != 0 {
        return None;
    }

    let host_bits = 128 - span.leading_zeros();
    Some((first, (128 - host_bits) as u8))
}
