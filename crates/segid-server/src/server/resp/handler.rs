use crate::server::{
    resp::{
        reply::{self, Reply},
        request::Request,
    },
    telemetry::{increment_command_errors, increment_commands, increment_ids_allocated},
};
use segid::{Manager, Store, validate_service_name};
use std::sync::Arc;

/// Turns one request into one reply.
pub trait ServeRequest: Send + Sync + 'static {
    fn serve(&self, request: Request) -> impl Future<Output = Reply> + Send;
}

/// Dispatches `GET`, `SET`, `EXISTS`, `DEL` and `SELECT` to a shared
/// [`Manager`].
pub struct CommandHandler<S> {
    manager: Arc<Manager<S>>,
}

impl<S> Clone for CommandHandler<S> {
    fn clone(&self) -> Self {
        Self {
            manager: Arc::clone(&self.manager),
        }
    }
}

impl<S> CommandHandler<S>
where
    S: Store,
{
    pub const fn new(manager: Arc<Manager<S>>) -> Self {
        Self { manager }
    }

    pub fn manager(&self) -> &Arc<Manager<S>> {
        &self.manager
    }

    /// `GET <name>`: next id as a bulk string, or nil for an unknown
    /// service. Never provisions.
    async fn get(&self, request: &Request) -> Reply {
        let name = match non_empty_key(request) {
            Ok(name) => name,
            Err(reply) => return reply,
        };

        match self.manager.next_id(&name).await {
            Ok(id) => {
                increment_ids_allocated(1);
                Reply::bulk_integer(id)
            }
            Err(err) if err.is_not_found() => reply::NIL,
            Err(err) => Reply::error(err.to_string()),
        }
    }

    /// `SET <name> <value> [force]`: provisions the service.
    async fn set(&self, request: &Request) -> Reply {
        let name = match request.get_string(0) {
            Ok(name) => name,
            Err(reply) => return reply,
        };
        let name = match validate_service_name(&name, self.manager.table_prefix()) {
            Ok(name) => name.to_owned(),
            Err(err) => return Reply::error(err.to_string()),
        };
        let value = match request.get_int(1) {
            Ok(value) if value < 0 => return reply::EXPECTED_POSITIVE_INTEGER,
            Ok(value) => value,
            Err(reply) => return reply,
        };
        let force = request.get_bool(2).unwrap_or(false);

        match self.manager.set_service_id(&name, value, force).await {
            Ok(_) => reply::OK,
            Err(err) => Reply::error(err.to_string()),
        }
    }

    /// `EXISTS <name>`: `:1` if the service is loaded, `:0` otherwise.
    fn exists(&self, request: &Request) -> Reply {
        match non_empty_key(request) {
            Ok(name) => Reply::Integer(i64::from(self.manager.service_exists(&name))),
            Err(reply) => reply,
        }
    }

    /// `DEL <name>`: `:1` once the service is gone.
    async fn del(&self, request: &Request) -> Reply {
        let name = match non_empty_key(request) {
            Ok(name) => name,
            Err(reply) => return reply,
        };

        match self.manager.del_service(&name).await {
            Ok(()) => Reply::Integer(1),
            Err(err) => Reply::error(err.to_string()),
        }
    }

    /// `SELECT <db>`: accepted and ignored.
    fn select(request: &Request) -> Reply {
        match request.argument(0) {
            Ok(db) if !db.is_empty() => reply::OK,
            _ => reply::NOT_ENOUGH_ARGS,
        }
    }
}

fn non_empty_key(request: &Request) -> Result<String, Reply> {
    let name = request.get_string(0)?;
    if name.is_empty() {
        return Err(reply::NO_KEY);
    }
    Ok(name.into_owned())
}

// Metric label for a command name. Anything a client can invent collapses
// to "OTHER" so the label set stays bounded.
fn command_label(command: &str) -> &'static str {
    match command {
        "GET" => "GET",
        "SET" => "SET",
        "EXISTS" => "EXISTS",
        "DEL" => "DEL",
        "SELECT" => "SELECT",
        _ => "OTHER",
    }
}

impl<S> ServeRequest for CommandHandler<S>
where
    S: Store,
{
    async fn serve(&self, request: Request) -> Reply {
        increment_commands(command_label(&request.command));

        let reply = match request.command.as_str() {
            "GET" => self.get(&request).await,
            "SET" => self.set(&request).await,
            "EXISTS" => self.exists(&request),
            "DEL" => self.del(&request).await,
            "SELECT" => Self::select(&request),
            _ => reply::METHOD_NOT_SUPPORTED,
        };

        if reply.is_error() {
            increment_command_errors();
            #[cfg(feature = "tracing")]
            tracing::debug!(command = %request.command, ?reply, "command failed");
        }
        reply
    }
}
