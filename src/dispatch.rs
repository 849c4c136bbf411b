//! Per-session routing of message ids to typed handlers.

use crate::debug;
use crate::error::{ReplicationError, Result};
use crate::protocol::{ConnectionId, MessageId, NetworkMessage};
use crate::serialization::NetworkReader;
use ahash::AHashMap;

/// What the router needs to know about the session it dispatches into.
pub trait AuthContext {
    fn is_authenticated(&self, connection_id: ConnectionId) -> bool;
}

type HandlerFn<C> = Box<dyn Fn(&mut C, ConnectionId, &mut NetworkReader<'_>) -> Result<()>>;

struct Handler<C> {
    name: &'static str,
    body_size: usize,
    requires_authentication: bool,
    invoke: HandlerFn<C>,
}

pub struct MessageRouter<C> {
    handlers: AHashMap<MessageId, Handler<C>>,
}

impl<C: AuthContext> MessageRouter<C> {
    pub fn new() -> Self {
        Self {
            handlers: AHashMap::new(),
        }
    }

    /// Registers `handler` for `M::ID`, replacing any previous handler.
    pub fn register<M, F>(&mut self, requires_authentication: bool, handler: F)
    where
        M: NetworkMessage,
        F: Fn(&mut C, ConnectionId, M) + 'static,
    {
        let invoke: HandlerFn<C> = Box::new(move |context, connection_id, reader| {
            let message = reader.read::<M>().ok_or_else(|| {
                ReplicationError::MalformedFrame(format!(
                    "truncated {} body from connection {}",
                    M::NAME,
                    connection_id
                ))
            })?;

            debug::log_message("Incoming", Some(connection_id), &message);
            handler(context, connection_id, message);
            Ok(())
        });

        let previous = self.handlers.insert(
            M::ID,
            Handler {
                name: M::NAME,
                body_size: M::SIZE,
                requires_authentication,
                invoke,
            },
        );

        if let Some(previous) = previous {
            tracing::warn!(
                "Replacing handler for {} (0x{:04x}), previously registered for {}",
                M::NAME, M::ID, previous.name
            );
        }
    }

    pub fn unregister(&mut self, message_id: MessageId) -> bool {
        self.handlers.remove(&message_id).is_some()
    }

    pub fn contains(&self, message_id: MessageId) -> bool {
        self.handlers.contains_key(&message_id)
    }

    /// Encoded body size of the message bound to `message_id`.
    pub fn body_size(&self, message_id: MessageId) -> Option<usize> {
        self.handlers.get(&message_id).map(|handler| handler.body_size)
    }

    pub fn registered_ids(&self) -> Vec<MessageId> {
        let mut ids: Vec<MessageId> = self.handlers.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Decodes one body for `message_id` from `reader` and invokes its handler.
    pub fn dispatch(
        &self,
        context: &mut C,
        connection_id: ConnectionId,
        message_id: MessageId,
        reader: &mut NetworkReader<'_>,
    ) -> Result<()> {
        let handler = self.handlers
            .get(&message_id)
            .ok_or(ReplicationError::UnknownMessage(message_id))?;

        if handler.requires_authentication && !context.is_authenticated(connection_id) {
            return Err(ReplicationError::Unauthenticated {
                connection_id,
                message_id,
            });
        }

        (handler.invoke)(context, connection_id, reader)
    }

    /// Runs an in-process message through the same path as received traffic.
    pub fn invoke<M: NetworkMessage>(
        &self,
        context: &mut C,
        connection_id: ConnectionId,
        message: &M,
    ) -> Result<()> {
        let mut body = Vec::with_capacity(M::SIZE);
        message.encode(&mut body);

        let mut reader = NetworkReader::new(&body);
        self.dispatch(context, connection_id, M::ID, &mut reader)
    }
}

impl<C: AuthContext> Default for MessageRouter<C> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{ConnectMessage, NetId, UnspawnMessage};
    use crate::serialization::NetworkWriter;

    #[derive(Default)]
    struct Recorder {
        authenticated: bool,
        connects: Vec<ConnectionId>,
        unspawns: Vec<NetId>,
    }

    impl AuthContext for Recorder {
        fn is_authenticated(&self, _connection_id: ConnectionId) -> bool {
            self.authenticated
        }
    }

    fn router() -> MessageRouter<Recorder> {
        let mut router = MessageRouter::new();
        router.register::<ConnectMessage, _>(false, |recorder: &mut Recorder, connection_id, _| {
            recorder.connects.push(connection_id);
        });
        router.register::<UnspawnMessage, _>(true, |recorder: &mut Recorder, _, message| {
            recorder.unspawns.push(message.net_id);
        });
        router
    }

    #[test]
    fn test_dispatch_decodes_and_invokes() {
        let router = router();
        let mut recorder = Recorder {
            authenticated: true,
            ..Default::default()
        };

        let mut writer = NetworkWriter::with_capacity(16);
        writer.write(&UnspawnMessage { net_id: NetId(12) });
        let mut reader = NetworkReader::new(writer.as_bytes());

        router
            .dispatch(&mut recorder, 3, UnspawnMessage::ID, &mut reader)
            .unwrap();
        assert_eq!(recorder.unspawns, vec![NetId(12)]);
        assert!(reader.is_empty());
    }

    #[test]
    fn test_unknown_id() {
        let router = router();
        let mut recorder = Recorder::default();
        let mut reader = NetworkReader::new(&[]);

        let result = router.dispatch(&mut recorder, 1, 0x0777, &mut reader);
        assert!(matches!(result, Err(ReplicationError::UnknownMessage(0x0777))));
    }

    #[test]
    fn test_requires_authentication() {
        let router = router();
        let mut recorder = Recorder::default();

        let mut writer = NetworkWriter::with_capacity(16);
        writer.write(&UnspawnMessage { net_id: NetId(12) });
        let mut reader = NetworkReader::new(writer.as_bytes());

        let result = router.dispatch(&mut recorder, 5, UnspawnMessage::ID, &mut reader);
        assert!(matches!(
            result,
            Err(ReplicationError::Unauthenticated { connection_id: 5, .. })
        ));
        assert!(recorder.unspawns.is_empty());

        router.invoke(&mut recorder, 5, &ConnectMessage).unwrap();
        assert_eq!(recorder.connects, vec![5]);
    }

    #[test]
    fn test_truncated_body() {
        let router = router();
        let mut recorder = Recorder {
            authenticated: true,
            ..Default::default()
        };
        let data = [1u8, 2, 3];
        let mut reader = NetworkReader::new(&data);

        let result = router.dispatch(&mut recorder, 1, UnspawnMessage::ID, &mut reader);
        assert!(matches!(result, Err(ReplicationError::MalformedFrame(_))));
        assert!(result.unwrap_err().is_protocol_violation());
        assert_eq!(reader.position(), 0);
    }

    #[test]
    fn test_replace_and_unregister() {
        let mut router = router();
        router.register::<ConnectMessage, _>(false, |_: &mut Recorder, _, _| {});
        assert_eq!(router.registered_ids(), vec![ConnectMessage::ID, UnspawnMessage::ID]);

        assert_eq!(router.body_size(UnspawnMessage::ID), Some(UnspawnMessage::SIZE));
        assert_eq!(router.body_size(ConnectMessage::ID), Some(0));

        assert!(router.unregister(ConnectMessage::ID));
        assert_eq!(router.body_size(ConnectMessage::ID), None);
        assert!(!router.contains(ConnectMessage::ID));
        assert!(!router.unregister(ConnectMessage::ID));
    }
}
