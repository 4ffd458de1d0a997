//! Static address and prefix assignment from a CSV mapping.
//!
//! The CSV has an `id` column holding a client identifier
//! (`duid:<hex>`, `interface-id:<hex>`, `remote-id:<enterprise>:<hex>`,
//! `subscriber-id:<hex>` or `linklayer-id:<type>:<hex>`) and `address` and
//! `prefix` columns. Lookups try the identifiers in that order, taking them
//! from the request and from the relay closest to the client.

use std::collections::HashMap;
use std::fs;
use std::net::Ipv6Addr;
use std::path::{Path, PathBuf};

use log::{debug, info, warn};

use sedge_proto::message::MessageType;
use sedge_proto::options::{
    DhcpOption, IaAddressOption, IaNaOption, IaPdOption, IaPrefixOption,
};
use sedge_proto::Duid;

use crate::bundle::TransactionBundle;
use crate::handlers::{Handler, HandlerResult};
use crate::ServerError;

#[derive(Copy, Clone)]
pub struct Lifetimes {
    pub address_preferred: u32,
    pub address_valid: u32,
    pub prefix_preferred: u32,
    pub prefix_valid: u32,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Assignment {
    pub address: Option<Ipv6Addr>,
    pub prefix: Option<(Ipv6Addr, u8)>,
}

pub struct CsvStaticAssignmentHandler {
    file: PathBuf,
    mapping: HashMap<String, Assignment>,
    lifetimes: Lifetimes,
}

impl CsvStaticAssignmentHandler {
    pub fn new(file: &Path, lifetimes: Lifetimes) -> Result<Self, ServerError> {
        let mapping = read_csv_file(file)?;
        info!(
            "Loaded {} static assignments from {}",
            mapping.len(),
            file.display()
        );

        Ok(Self {
            file: file.to_path_buf(),
            mapping,
            lifetimes,
        })
    }

    /// Look up the assignment for this client: DUID first, then the
    /// identification options of the relay closest to the client.
    fn assignment(&self, bundle: &TransactionBundle) -> Option<&Assignment> {
        for key in identifier_keys(bundle) {
            if let Some(assignment) = self.mapping.get(&key) {
                debug!("Found static assignment for {}", key);
                return Some(assignment);
            }
        }

        None
    }
}

/// The identity strings a bundle can be looked up by, most specific first.
pub fn identifier_keys(bundle: &TransactionBundle) -> Vec<String> {
    let mut keys = Vec::new();

    if let Some(request) = &bundle.request {
        if let Some(duid) = request.client_id() {
            keys.push(format!("duid:{}", duid.hex()));
        }
    }

    if let Some(relay) = bundle.relay_closest_to_client() {
        for option in &relay.options {
            match option {
                DhcpOption::InterfaceId(interface_id) => {
                    keys.push(format!("interface-id:{}", hex::encode(interface_id)));
                }
                DhcpOption::RemoteId(remote) => {
                    keys.push(format!("remote-id:{}", remote.identity()));
                }
                DhcpOption::SubscriberId(subscriber_id) => {
                    keys.push(format!("subscriber-id:{}", hex::encode(subscriber_id)));
                }
                DhcpOption::LinkLayerId(link_layer) => {
                    keys.push(format!(
                        "linklayer-id:{}:{}",
                        link_layer.link_layer_type,
                        hex::encode(&link_layer.link_layer_address)
                    ));
                }
                _ => {}
            }
        }
    }

    keys
}

/// Whether the request is one that hands out leases.
fn lease_request(bundle: &TransactionBundle) -> bool {
    bundle
        .request
        .as_ref()
        .map(|request| {
            matches!(
                request.message_type,
                MessageType::Solicit
                    | MessageType::Request
                    | MessageType::Renew
                    | MessageType::Rebind
            )
        })
        .unwrap_or(false)
}

/// Put the assignment into the response: the first unanswered IA_NA gets the
/// address, the first unanswered IA_PD gets the prefix. The unanswered-IA
/// handler deals with everything left over.
fn answer_with(bundle: &mut TransactionBundle, assignment: &Assignment, lifetimes: Lifetimes) {
    if let Some(address) = assignment.address {
        if let Some(ia) = bundle
            .unhandled_options(|option| matches!(option, DhcpOption::IaNa(_)))
            .first()
        {
            let DhcpOption::IaNa(request_ia) = ia else {
                unreachable!()
            };

            let mut answer = IaNaOption::new(request_ia.iaid);
            answer.options.push(DhcpOption::IaAddress(IaAddressOption::new(
                address,
                lifetimes.address_preferred,
                lifetimes.address_valid,
            )));

            if let Some(response) = bundle.response.as_mut() {
                response.options.push(DhcpOption::IaNa(answer));
            }
            let handled = ia.clone();
            bundle.mark_handled(&handled);
        }
    }

    if let Some((prefix, prefix_length)) = assignment.prefix {
        if let Some(ia) = bundle
            .unhandled_options(|option| matches!(option, DhcpOption::IaPd(_)))
            .first()
        {
            let DhcpOption::IaPd(request_ia) = ia else {
                unreachable!()
            };

            let mut answer = IaPdOption::new(request_ia.iaid);
            answer.options.push(DhcpOption::IaPrefix(IaPrefixOption::new(
                prefix,
                prefix_length,
                lifetimes.prefix_preferred,
                lifetimes.prefix_valid,
            )));

            if let Some(response) = bundle.response.as_mut() {
                response.options.push(DhcpOption::IaPd(answer));
            }
            let handled = ia.clone();
            bundle.mark_handled(&handled);
        }
    }
}

impl Handler for CsvStaticAssignmentHandler {
    fn name(&self) -> &'static str {
        "static-csv"
    }

    fn handle(&mut self, bundle: &mut TransactionBundle) -> HandlerResult {
        if !lease_request(bundle) {
            return Ok(());
        }

        let Some(assignment) = self.assignment(bundle).cloned() else {
            return Ok(());
        };
        answer_with(bundle, &assignment, self.lifetimes);

        Ok(())
    }
}

/// Static assignments from an SQLite `assignments` table, looked up per
/// request. Each worker opens its own read-only connection, so an external
/// process can rewrite assignments while the server runs.
pub struct SqliteStaticAssignmentHandler {
    path: PathBuf,
    db: Option<rusqlite::Connection>,
    lifetimes: Lifetimes,
}

impl SqliteStaticAssignmentHandler {
    pub fn new(path: &Path, lifetimes: Lifetimes) -> Self {
        Self {
            path: path.to_path_buf(),
            db: None,
            lifetimes,
        }
    }

    fn lookup(&self, keys: &[String]) -> Result<Option<Assignment>, rusqlite::Error> {
        let Some(db) = &self.db else {
            return Ok(None);
        };

        let mut stmt = db.prepare_cached("SELECT address, prefix FROM assignments WHERE id=?")?;
        for key in keys {
            let row = stmt
                .query_row([key], |row| {
                    Ok((
                        row.get::<_, Option<String>>(0)?,
                        row.get::<_, Option<String>>(1)?,
                    ))
                })
                .map(Some)
                .or_else(|e| match e {
                    rusqlite::Error::QueryReturnedNoRows => Ok(None),
                    other => Err(other),
                })?;

            let Some((address, prefix)) = row else {
                continue;
            };

            let mut assignment = Assignment::default();
            if let Some(address) = address.filter(|a| !a.is_empty()) {
                match address.parse() {
                    Ok(address) => assignment.address = Some(address),
                    Err(_) => {
                        warn!("Ignoring bad address for {} in {}", key, self.path.display())
                    }
                }
            }
            if let Some(prefix) = prefix.filter(|p| !p.is_empty()) {
                match parse_prefix(&prefix) {
                    Ok(prefix) => assignment.prefix = Some(prefix),
                    Err(_) => {
                        warn!("Ignoring bad prefix for {} in {}", key, self.path.display())
                    }
                }
            }

            debug!("Found static assignment for {}", key);
            return Ok(Some(assignment));
        }

        Ok(None)
    }
}

impl Handler for SqliteStaticAssignmentHandler {
    fn name(&self) -> &'static str {
        "static-sqlite"
    }

    fn worker_init(&mut self) -> Result<(), ServerError> {
        info!("Opening static assignments database {}", self.path.display());

        let db = rusqlite::Connection::open_with_flags(
            &self.path,
            rusqlite::OpenFlags::SQLITE_OPEN_READ_ONLY,
        )?;
        db.busy_timeout(std::time::Duration::from_secs(2))?;
        self.db = Some(db);

        Ok(())
    }

    fn handle(&mut self, bundle: &mut TransactionBundle) -> HandlerResult {
        if !lease_request(bundle) {
            return Ok(());
        }

        let assignment = match self.lookup(&identifier_keys(bundle)) {
            Ok(Some(assignment)) => assignment,
            Ok(None) => return Ok(()),
            Err(e) => {
                warn!("Static assignment lookup failed: {}", e);
                return Ok(());
            }
        };

        answer_with(bundle, &assignment, self.lifetimes);

        Ok(())
    }
}

impl std::fmt::Debug for CsvStaticAssignmentHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "CsvStaticAssignmentHandler({}, {} entries)",
            self.file.display(),
            self.mapping.len()
        )
    }
}

fn read_csv_file(path: &Path) -> Result<HashMap<String, Assignment>, ServerError> {
    let text = fs::read_to_string(path)
        .map_err(|e| ServerError::Config(format!("{}: {}", path.display(), e)))?;

    parse_csv(&text).map_err(|e| ServerError::Config(format!("{}: {}", path.display(), e)))
}

fn parse_csv(text: &str) -> Result<HashMap<String, Assignment>, String> {
    let mut lines = text.lines().filter(|line| !line.trim().is_empty());

    let header = lines.next().ok_or("empty assignments file")?;
    let columns: Vec<&str> = header.split(',').map(str::trim).collect();
    let id_column = columns
        .iter()
        .position(|c| *c == "id")
        .ok_or("missing 'id' column")?;
    let address_column = columns.iter().position(|c| *c == "address");
    let prefix_column = columns.iter().position(|c| *c == "prefix");

    let mut mapping = HashMap::new();
    for (number, line) in lines.enumerate() {
        let fields: Vec<&str> = line.split(',').map(str::trim).collect();

        let id = fields
            .get(id_column)
            .copied()
            .filter(|id| !id.is_empty())
            .ok_or_else(|| format!("line {}: missing id", number + 2))?;
        let id = normalize_identifier(id).map_err(|e| format!("line {}: {}", number + 2, e))?;

        let mut assignment = Assignment::default();

        if let Some(column) = address_column {
            if let Some(value) = fields.get(column).copied().filter(|v| !v.is_empty()) {
                assignment.address = Some(
                    value
                        .parse()
                        .map_err(|_| format!("line {}: bad address {}", number + 2, value))?,
                );
            }
        }

        if let Some(column) = prefix_column {
            if let Some(value) = fields.get(column).copied().filter(|v| !v.is_empty()) {
                assignment.prefix =
                    Some(parse_prefix(value).map_err(|e| format!("line {}: {}", number + 2, e))?);
            }
        }

        mapping.insert(id, assignment);
    }

    Ok(mapping)
}

/// Normalise an identifier to the form `identifier_keys` produces, so that
/// differently-written hex (case, separators) still matches.
fn normalize_identifier(id: &str) -> Result<String, String> {
    let (kind, rest) = id
        .split_once(':')
        .ok_or_else(|| format!("bad identifier {}", id))?;

    match kind {
        "duid" => {
            let data = crate::config::parse_hex(rest).ok_or("bad DUID hex")?;
            let duid = Duid::parse(&data).map_err(|e| format!("bad DUID: {}", e))?;
            Ok(format!("duid:{}", duid.hex()))
        }
        "interface-id" | "subscriber-id" => {
            let data = crate::config::parse_hex(rest).ok_or("bad hex identifier")?;
            Ok(format!("{}:{}", kind, hex::encode(data)))
        }
        "remote-id" | "linklayer-id" => {
            let (number, data_hex) = rest
                .split_once(':')
                .ok_or_else(|| format!("bad identifier {}", id))?;
            let number: u32 = number.parse().map_err(|_| "bad enterprise/type number")?;
            let data = crate::config::parse_hex(data_hex).ok_or("bad hex identifier")?;
            Ok(format!("{}:{}:{}", kind, number, hex::encode(data)))
        }
        _ => Err(format!("unknown identifier type {}", kind)),
    }
}

fn parse_prefix(value: &str) -> Result<(Ipv6Addr, u8), String> {
    let (address, length) = value
        .split_once('/')
        .ok_or_else(|| format!("bad prefix {}", value))?;
    let address: Ipv6Addr = address
        .parse()
        .map_err(|_| format!("bad prefix address {}", address))?;
    let length: u8 = length.parse().map_err(|_| format!("bad prefix length {}", length))?;
    if length > 128 {
        return Err(format!("bad prefix length {}", length));
    }

    Ok((address, length))
}

#[cfg(test)]
mod test {
    use super::*;
    use sedge_proto::message::{ClientServerMessage, Message};

    const CSV: &str = "\
id,address,prefix
duid:000300013431c43cb2f1,2001:db8::100,2001:db8:100::/56
interface-id:4661322f31,2001:db8::200,
remote-id:9:02000000,,2001:db8:200::/56
";

    fn handler() -> CsvStaticAssignmentHandler {
        let mapping = parse_csv(CSV).unwrap();
        CsvStaticAssignmentHandler {
            file: PathBuf::from("test.csv"),
            mapping,
            lifetimes: Lifetimes {
                address_preferred: 375,
                address_valid: 600,
                prefix_preferred: 375,
                prefix_valid: 600,
            },
        }
    }

    fn client_duid() -> Duid {
        Duid::LinkLayer {
            hardware_type: 1,
            link_layer_address: vec![0x34, 0x31, 0xc4, 0x3c, 0xb2, 0xf1],
        }
    }

    fn solicit_bundle() -> TransactionBundle {
        let mut request = ClientServerMessage::new(MessageType::Solicit, [1, 2, 3]);
        request.options.push(DhcpOption::ClientId(client_duid()));
        request.options.push(DhcpOption::IaNa(IaNaOption::new(0xc43cb2f1)));
        request.options.push(DhcpOption::IaPd(IaPdOption::new(1)));

        let mut bundle = TransactionBundle::new(Message::ClientServer(request), true, false);
        bundle.response = Some(ClientServerMessage::new(MessageType::Advertise, [1, 2, 3]));
        bundle
    }

    #[test]
    fn parses_and_normalizes() {
        let mapping = parse_csv(CSV).unwrap();
        assert_eq!(mapping.len(), 3);
        let assignment = &mapping["duid:000300013431c43cb2f1"];
        assert_eq!(assignment.address, Some("2001:db8::100".parse().unwrap()));
        assert_eq!(
            assignment.prefix,
            Some(("2001:db8:100::".parse().unwrap(), 56))
        );
    }

    #[test]
    fn assigns_address_and_prefix_by_duid() {
        let mut handler = handler();
        let mut bundle = solicit_bundle();

        handler.handle(&mut bundle).unwrap();

        let response = bundle.response.as_ref().unwrap();
        assert_eq!(response.options.len(), 2);
        match &response.options[0] {
            DhcpOption::IaNa(ia) => {
                assert_eq!(ia.iaid, 0xc43cb2f1);
                let addresses: Vec<_> = ia.addresses().collect();
                assert_eq!(addresses[0].address, "2001:db8::100".parse::<Ipv6Addr>().unwrap());
                assert_eq!(addresses[0].preferred_lifetime, 375);
                assert_eq!(addresses[0].valid_lifetime, 600);
            }
            other => panic!("unexpected option {:?}", other),
        }
        // both IAs are now handled
        assert_eq!(bundle.handled_options().len(), 2);
    }

    #[test]
    fn unknown_client_is_left_for_the_filler() {
        let mut handler = handler();

        let mut request = ClientServerMessage::new(MessageType::Solicit, [1, 2, 3]);
        request.options.push(DhcpOption::ClientId(Duid::LinkLayer {
            hardware_type: 1,
            link_layer_address: vec![9, 9, 9, 9, 9, 9],
        }));
        request.options.push(DhcpOption::IaNa(IaNaOption::new(1)));
        let mut bundle = TransactionBundle::new(Message::ClientServer(request), true, false);
        bundle.response = Some(ClientServerMessage::new(MessageType::Advertise, [1, 2, 3]));

        handler.handle(&mut bundle).unwrap();
        assert!(bundle.response.as_ref().unwrap().options.is_empty());
        assert!(bundle.handled_options().is_empty());
    }

    #[test]
    fn sqlite_assignments() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("assignments.sqlite");

        let db = rusqlite::Connection::open(&path).unwrap();
        db.execute_batch(
            "CREATE TABLE assignments (
                 id TEXT NOT NULL PRIMARY KEY,
                 address TEXT,
                 prefix TEXT,
                 csv_mtime INT NOT NULL DEFAULT 0
             ) WITHOUT ROWID;",
        )
        .unwrap();
        db.execute(
            "INSERT INTO assignments (id, address, prefix)
             VALUES ('duid:000300013431c43cb2f1', '2001:db8::300', '2001:db8:300::/56')",
            [],
        )
        .unwrap();
        drop(db);

        let mut handler = SqliteStaticAssignmentHandler::new(
            &path,
            Lifetimes {
                address_preferred: 375,
                address_valid: 600,
                prefix_preferred: 375,
                prefix_valid: 600,
            },
        );
        handler.worker_init().unwrap();

        let mut bundle = solicit_bundle();
        handler.handle(&mut bundle).unwrap();

        let response = bundle.response.as_ref().unwrap();
        assert_eq!(response.options.len(), 2);
        match &response.options[1] {
            DhcpOption::IaPd(ia) => {
                let prefixes: Vec<_> = ia.prefixes().collect();
                assert_eq!(prefixes[0].prefix, "2001:db8:300::".parse::<Ipv6Addr>().unwrap());
                assert_eq!(prefixes[0].prefix_length, 56);
            }
            other => panic!("unexpected option {:?}", other),
        }
    }

    #[test]
    fn information_request_is_ignored() {
        let mut handler = handler();

        let mut request =
            ClientServerMessage::new(MessageType::InformationRequest, [1, 2, 3]);
        request.options.push(DhcpOption::ClientId(client_duid()));
        let mut bundle = TransactionBundle::new(Message::ClientServer(request), true, false);
        bundle.response = Some(ClientServerMessage::new(MessageType::Reply, [1, 2, 3]));

        handler.handle(&mut bundle).unwrap();
        assert!(bundle.response.as_ref().unwrap().options.is_empty());
    }
}
