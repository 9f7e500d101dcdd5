use std::fmt;

use uuid::Uuid;

/// Keys of the storage, without the configured prefix.
pub(crate) enum Key<'a> {
    /// A schema document, as JSON.
    Document { hash: &'a str },
    /// An agent registration, as JSON. Expires after the retention period.
    Registration { graph_ref: &'a str, boot_id: Uuid },
    /// Sorted set of the active boot ids of a graph, scored by their last report in
    /// milliseconds.
    Fleet { graph_ref: &'a str },
    /// Set of every retained boot id of a graph.
    Boots { graph_ref: &'a str },
    /// The claim of a server id, as JSON.
    Server { graph_ref: &'a str, server_id: &'a str },
    /// Set of the claimed server ids of a graph.
    Servers { graph_ref: &'a str },
    /// Set of every graph with registrations.
    Graphs,
}

impl fmt::Display for Key<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Key::Document { hash } => write!(f, "document:{hash}"),
            Key::Registration { graph_ref, boot_id } => write!(f, "registration:{graph_ref}:{boot_id}"),
            Key::Fleet { graph_ref } => write!(f, "fleet:{graph_ref}"),
            Key::Boots { graph_ref } => write!(f, "boots:{graph_ref}"),
            // server ids are free-form and variants may contain colons
            Key::Server { graph_ref, server_id } => write!(f, "server:{graph_ref}:{}", hex::encode(server_id)),
            Key::Servers { graph_ref } => write!(f, "servers:{graph_ref}"),
            Key::Graphs => f.write_str("graphs"),
        }
    }
}
