//! Connection requests and accepted connections between two users.
//!
//! Both records are keyed by [`pair_id`], so there is at most one request
//! and at most one connection per unordered pair. A request sent while the
//! reverse request is pending turns into a connection.

use crate::database::*;
use crate::error::{abort, Error};
use crate::identity::{require_user, UserDb};
use crate::model::*;
use chrono::{DateTime, Utc};
use log::{debug, info};
use sled::transaction::{ConflictableTransactionResult, Transactional, TransactionalTree};

pub trait ConnectionDb {
    type Error;
    fn connection_status(&self, viewer: &str, target: &str)
        -> Result<ConnectionStatus, Self::Error>;
    fn is_connected(&self, a: &str, b: &str) -> Result<bool, Self::Error>;
    fn send_request(&self, from: &str, to: &str) -> Result<ConnectionStatus, Self::Error>;
    fn accept_request(&self, request_id: &str, from: &str, to: &str)
        -> Result<Connection, Self::Error>;
    fn reject_request(&self, request_id: &str) -> Result<(), Self::Error>;
    fn cancel_request(&self, from: &str, to: &str) -> Result<(), Self::Error>;
    fn list_incoming(&self, uid: &str) -> Result<Vec<IncomingRequest>, Self::Error>;
    fn list_connections(&self, uid: &str) -> Result<Vec<UserId>, Self::Error>;
    fn remove_connection(&self, a: &str, b: &str) -> Result<(), Self::Error>;
}

struct ConnectionTrees {
    connections: sled::Tree,
    user_connections: sled::Tree,
    requests: sled::Tree,
    incoming: sled::Tree,
}

impl ConnectionTrees {
    fn open(db: &sled::Db) -> sled::Result<ConnectionTrees> {
        Ok(ConnectionTrees {
            connections: db.open_tree(CONNECTIONS)?,
            user_connections: db.open_tree(USER_CONNECTIONS)?,
            requests: db.open_tree(CONNECTION_REQUESTS)?,
            incoming: db.open_tree(INCOMING_REQUESTS)?,
        })
    }
}

fn write_connection(
    connections: &TransactionalTree,
    user_connections: &TransactionalTree,
    a: &str,
    b: &str,
    created_at: DateTime<Utc>,
) -> ConflictableTransactionResult<Connection, Error> {
    let id = pair_id(a, b);
    if let Some(existing) = connections.get(id.as_bytes())? {
        return decode_tx(existing);
    }
    let connection = Connection {
        id: id.clone(),
        users: if a <= b {
            (a.to_owned(), b.to_owned())
        } else {
            (b.to_owned(), a.to_owned())
        },
        created_at,
    };
    connections.insert(id.as_bytes(), encode_tx(&connection)?)?;
    user_connections.insert(compound_key(&[a.as_bytes(), b.as_bytes()]), id.as_bytes())?;
    user_connections.insert(compound_key(&[b.as_bytes(), a.as_bytes()]), id.as_bytes())?;
    Ok(connection)
}

fn delete_request(
    requests: &TransactionalTree,
    incoming: &TransactionalTree,
    request: &ConnectionRequest,
) -> ConflictableTransactionResult<(), Error> {
    requests.remove(request.id.as_bytes())?;
    incoming.remove(compound_key(&[request.to.as_bytes(), request.id.as_bytes()]))?;
    Ok(())
}

fn read_request(
    requests: &TransactionalTree,
    request_id: &str,
) -> ConflictableTransactionResult<Option<ConnectionRequest>, Error> {
    match requests.get(request_id.as_bytes())? {
        Some(bytes) => Ok(Some(decode_tx(bytes)?)),
        None => Ok(None),
    }
}

impl ConnectionDb for sled::Db {
    type Error = Error;

    fn connection_status(&self, viewer: &str, target: &str) -> Result<ConnectionStatus, Error> {
        if viewer == target {
            return Ok(ConnectionStatus::None);
        }
        let trees = ConnectionTrees::open(self)?;
        let id = pair_id(viewer, target);
        if trees.connections.contains_key(id.as_bytes())? {
            return Ok(ConnectionStatus::Accepted);
        }
        if let Some(bytes) = trees.requests.get(id.as_bytes())? {
            let request: ConnectionRequest = decode(bytes)?;
            if request.from == viewer && request.to == target {
                return Ok(ConnectionStatus::Pending {
                    request_id: request.id,
                });
            }
            if request.from == target && request.to == viewer {
                return Ok(ConnectionStatus::Incoming {
                    request_id: request.id,
                });
            }
        }
        Ok(ConnectionStatus::None)
    }

    fn is_connected(&self, a: &str, b: &str) -> Result<bool, Error> {
        let connections = self.open_tree(CONNECTIONS)?;
        Ok(connections.contains_key(pair_id(a, b).as_bytes())?)
    }

    fn send_request(&self, from: &str, to: &str) -> Result<ConnectionStatus, Error> {
        if from == to {
            return Err(Error::conflict("cannot connect with yourself"));
        }
        require_user(self, to)?;
        let trees = ConnectionTrees::open(self)?;
        let id = pair_id(from, to);
        let now = Utc::now();
        let status = (
            &trees.connections,
            &trees.user_connections,
            &trees.requests,
            &trees.incoming,
        )
            .transaction(
                |(connections, user_connections, requests, incoming)| -> ConflictableTransactionResult<ConnectionStatus, Error> {
                    if connections.get(id.as_bytes())?.is_some() {
                        return Ok(ConnectionStatus::Accepted);
                    }
                    if let Some(existing) = read_request(requests, &id)? {
                        if existing.from == from {
                            return abort(Error::conflict(format!(
                                "request from {} to {} is already pending",
                                from, to
                            )));
                        }
                        write_connection(connections, user_connections, from, to, now)?;
                        delete_request(requests, incoming, &existing)?;
                        return Ok(ConnectionStatus::Accepted);
                    }
                    let request = ConnectionRequest {
                        id: id.clone(),
                        from: from.to_owned(),
                        to: to.to_owned(),
                        created_at: now,
                    };
                    requests.insert(id.as_bytes(), encode_tx(&request)?)?;
                    incoming.insert(
                        compound_key(&[to.as_bytes(), id.as_bytes()]),
                        id.as_bytes(),
                    )?;
                    Ok(ConnectionStatus::Pending {
                        request_id: id.clone(),
                    })
                },
            )?;
        match &status {
            ConnectionStatus::Accepted => info!("{} and {} are connected", from, to),
            _ => info!("{} requested to connect with {}", from, to),
        }
        Ok(status)
    }

    fn accept_request(&self, request_id: &str, from: &str, to: &str) -> Result<Connection, Error> {
        let trees = ConnectionTrees::open(self)?;
        let now = Utc::now();
        let connection = (
            &trees.connections,
            &trees.user_connections,
            &trees.requests,
            &trees.incoming,
        )
            .transaction(
                |(connections, user_connections, requests, incoming)| -> ConflictableTransactionResult<Connection, Error> {
                    let request = match read_request(requests, request_id)? {
                        Some(request) if request.from == from && request.to == to => request,
                        _ => {
                            return abort(Error::not_found(format!(
                                "request {} from {} to {}",
                                request_id, from, to
                            )))
                        }
                    };
                    let connection = write_connection(connections, user_connections, from, to, now)?;
                    delete_request(requests, incoming, &request)?;
                    Ok(connection)
                },
            )?;
        info!("{} accepted the request from {}", to, from);
        Ok(connection)
    }

    fn reject_request(&self, request_id: &str) -> Result<(), Error> {
        let trees = ConnectionTrees::open(self)?;
        (&trees.requests, &trees.incoming).transaction(
            |(requests, incoming)| -> ConflictableTransactionResult<(), Error> {
                match read_request(requests, request_id)? {
                    Some(request) => delete_request(requests, incoming, &request),
                    None => abort(Error::not_found(format!("request {}", request_id))),
                }
            },
        )?;
        debug!("rejected request {}", request_id);
        Ok(())
    }

    fn cancel_request(&self, from: &str, to: &str) -> Result<(), Error> {
        let trees = ConnectionTrees::open(self)?;
        let id = pair_id(from, to);
        (&trees.requests, &trees.incoming).transaction(
            |(requests, incoming)| -> ConflictableTransactionResult<(), Error> {
                match read_request(requests, &id)? {
                    Some(request) if request.from == from => {
                        delete_request(requests, incoming, &request)
                    }
                    _ => abort(Error::not_found(format!("request from {} to {}", from, to))),
                }
            },
        )?;
        debug!("{} withdrew the request to {}", from, to);
        Ok(())
    }

    fn list_incoming(&self, uid: &str) -> Result<Vec<IncomingRequest>, Error> {
        let trees = ConnectionTrees::open(self)?;
        let mut incoming = Vec::new();
        for key in trees.incoming.scan_prefix(prefix_of(uid.as_bytes())).keys() {
            let key = key?;
            let request: ConnectionRequest = match trees.requests.get(key_suffix(&key))? {
                Some(bytes) => decode(bytes)?,
                None => continue,
            };
            let requester = require_user(self, &request.from)?;
            incoming.push(IncomingRequest { request, requester });
        }
        incoming.sort_by(|a, b| b.request.created_at.cmp(&a.request.created_at));
        Ok(incoming)
    }

    fn list_connections(&self, uid: &str) -> Result<Vec<UserId>, Error> {
        let user_connections = self.open_tree(USER_CONNECTIONS)?;
        user_connections
            .scan_prefix(prefix_of(uid.as_bytes()))
            .keys()
            .map(|key| -> Result<UserId, Error> {
                Ok(String::from_utf8_lossy(key_suffix(&key?)).into_owned())
            })
            .collect()
    }

    fn remove_connection(&self, a: &str, b: &str) -> Result<(), Error> {
        let trees = ConnectionTrees::open(self)?;
        let id = pair_id(a, b);
        (&trees.connections, &trees.user_connections).transaction(
            |(connections, user_connections)| -> ConflictableTransactionResult<(), Error> {
                if connections.remove(id.as_bytes())?.is_none() {
                    return abort(Error::not_found(format!("connection {}", id)));
                }
                user_connections.remove(compound_key(&[a.as_bytes(), b.as_bytes()]))?;
                user_connections.remove(compound_key(&[b.as_bytes(), a.as_bytes()]))?;
                Ok(())
            },
        )?;
        info!("{} and {} are no longer connected", a, b);
        Ok(())
    }
}

/// Everyone `uid` is connected with, as full user records.
pub fn connected_users(db: &sled::Db, uid: &str) -> Result<Vec<User>, Error> {
    let mut users = Vec::new();
    for peer in db.list_connections(uid)? {
        if let Some(user) = db.get_user(&peer)? {
            users.push(user);
        }
    }
    Ok(users)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::test_user;

    fn setup() -> sled::Db {
        let db = temporary();
        test_user(&db, "alice");
        test_user(&db, "bob");
        test_user(&db, "carol");
        db
    }

    fn request_id(status: ConnectionStatus) -> String {
        match status {
            ConnectionStatus::Pending { request_id } => request_id,
            other => panic!("expected pending, got {:?}", other),
        }
    }

    #[test]
    fn request_then_accept() {
        let db = setup();
        assert_eq!(db.connection_status("alice", "bob").unwrap(), ConnectionStatus::None);
        let id = request_id(db.send_request("alice", "bob").unwrap());
        assert_eq!(
            db.connection_status("alice", "bob").unwrap(),
            ConnectionStatus::Pending { request_id: id.clone() }
        );
        assert_eq!(
            db.connection_status("bob", "alice").unwrap(),
            ConnectionStatus::Incoming { request_id: id.clone() }
        );

        let incoming = db.list_incoming("bob").unwrap();
        assert_eq!(incoming.len(), 1);
        assert_eq!(incoming[0].requester.uid, "alice");
        assert!(db.list_incoming("alice").unwrap().is_empty());

        let connection = db.accept_request(&id, "alice", "bob").unwrap();
        assert_eq!(connection.id, pair_id("alice", "bob"));
        assert_eq!(db.connection_status("alice", "bob").unwrap(), ConnectionStatus::Accepted);
        assert_eq!(db.connection_status("bob", "alice").unwrap(), ConnectionStatus::Accepted);
        assert!(db.list_incoming("bob").unwrap().is_empty());
        assert_eq!(db.list_connections("alice").unwrap(), vec!["bob".to_owned()]);
        assert_eq!(db.list_connections("bob").unwrap(), vec!["alice".to_owned()]);
    }

    #[test]
    fn accepted_wins_over_stale_request() {
        let db = setup();
        let id = request_id(db.send_request("alice", "bob").unwrap());
        db.accept_request(&id, "alice", "bob").unwrap();
        // leave a request behind as if an older writer crashed half way
        let requests = db.open_tree(CONNECTION_REQUESTS).unwrap();
        let stale = ConnectionRequest {
            id: id.clone(),
            from: "bob".to_owned(),
            to: "alice".to_owned(),
            created_at: Utc::now(),
        };
        requests.insert(id.as_bytes(), encode(&stale).unwrap()).unwrap();
        assert_eq!(db.connection_status("alice", "bob").unwrap(), ConnectionStatus::Accepted);
        assert_eq!(db.connection_status("bob", "alice").unwrap(), ConnectionStatus::Accepted);
    }

    #[test]
    fn duplicate_request_conflicts() {
        let db = setup();
        db.send_request("alice", "bob").unwrap();
        match db.send_request("alice", "bob") {
            Err(Error::Conflict(_)) => {}
            other => panic!("expected conflict, got {:?}", other),
        }
        assert_eq!(db.list_incoming("bob").unwrap().len(), 1);
    }

    #[test]
    fn crossed_requests_connect() {
        let db = setup();
        db.send_request("alice", "bob").unwrap();
        assert_eq!(db.send_request("bob", "alice").unwrap(), ConnectionStatus::Accepted);
        assert!(db.is_connected("alice", "bob").unwrap());
        assert!(db.list_incoming("alice").unwrap().is_empty());
        assert!(db.list_incoming("bob").unwrap().is_empty());
        // already connected, nothing changes
        assert_eq!(db.send_request("alice", "bob").unwrap(), ConnectionStatus::Accepted);
    }

    #[test]
    fn concurrent_crossed_requests_resolve_to_one_state() {
        let db = setup();
        let handles: Vec<_> = vec![("alice", "bob"), ("bob", "alice")]
            .into_iter()
            .map(|(from, to)| {
                let db = db.clone();
                std::thread::spawn(move || db.send_request(from, to).unwrap())
            })
            .collect();
        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert!(results.contains(&ConnectionStatus::Accepted));
        assert!(db.is_connected("alice", "bob").unwrap());
        assert_eq!(db.open_tree(CONNECTION_REQUESTS).unwrap().len(), 0);
    }

    #[test]
    fn reject_and_cancel() {
        let db = setup();
        let id = request_id(db.send_request("alice", "bob").unwrap());
        db.reject_request(&id).unwrap();
        assert_eq!(db.connection_status("alice", "bob").unwrap(), ConnectionStatus::None);
        match db.reject_request(&id) {
            Err(Error::NotFound(_)) => {}
            other => panic!("expected not found, got {:?}", other),
        }

        db.send_request("carol", "bob").unwrap();
        assert!(db.cancel_request("bob", "carol").is_err());
        db.cancel_request("carol", "bob").unwrap();
        assert!(db.list_incoming("bob").unwrap().is_empty());
    }

    #[test]
    fn accept_checks_the_request() {
        let db = setup();
        let id = request_id(db.send_request("alice", "bob").unwrap());
        assert!(db.accept_request(&id, "bob", "alice").is_err());
        assert!(db.accept_request("nope", "alice", "bob").is_err());
        assert!(!db.is_connected("alice", "bob").unwrap());
    }

    #[test]
    fn requests_need_a_real_target() {
        let db = setup();
        assert!(db.send_request("alice", "alice").is_err());
        match db.send_request("alice", "ghost") {
            Err(Error::NotFound(_)) => {}
            other => panic!("expected not found, got {:?}", other),
        }
    }

    #[test]
    fn underscored_uids_do_not_share_a_pair() {
        let db = temporary();
        for uid in &["a_b", "c", "a", "b_c"] {
            test_user(&db, uid);
        }
        db.send_request("a_b", "c").unwrap();
        db.send_request("c", "a_b").unwrap();
        assert!(db.is_connected("a_b", "c").unwrap());

        assert_eq!(db.connection_status("a", "b_c").unwrap(), ConnectionStatus::None);
        assert!(!db.is_connected("a", "b_c").unwrap());
        let id = request_id(db.send_request("a", "b_c").unwrap());
        assert_ne!(id, pair_id("a_b", "c"));
        assert_eq!(db.list_incoming("b_c").unwrap().len(), 1);
        assert!(db.list_connections("a").unwrap().is_empty());
    }

    #[test]
    fn remove_connection_clears_both_sides() {
        let db = setup();
        db.send_request("alice", "bob").unwrap();
        db.send_request("bob", "alice").unwrap();
        db.remove_connection("bob", "alice").unwrap();
        assert_eq!(db.connection_status("alice", "bob").unwrap(), ConnectionStatus::None);
        assert!(db.list_connections("alice").unwrap().is_empty());
        assert!(db.list_connections("bob").unwrap().is_empty());
        assert!(db.remove_connection("alice", "bob").is_err());
    }

    #[test]
    fn connected_users_are_resolved() {
        let db = setup();
        db.send_request("alice", "bob").unwrap();
        db.send_request("bob", "alice").unwrap();
        db.send_request("alice", "carol").unwrap();
        db.send_request("carol", "alice").unwrap();
        let names: Vec<_> = connected_users(&db, "alice")
            .unwrap()
            .into_iter()
            .map(|u| u.display_name)
            .collect();
        assert_eq!(names, vec!["BOB", "CAROL"]);
    }
}
