//! The `describe` op: advertise the ops and versions of this server.

use std::collections::BTreeMap;
use std::sync::Arc;

use futures::future::BoxFuture;

use nrepl_types::{ops, Item, Status};

use crate::middleware::{Descriptor, HandlerError, Middleware, Next, OpInfo, Request};
use crate::runtime::Runtime;

pub struct Describe {
    descriptor: Descriptor,
    runtime: Arc<dyn Runtime>,
}

impl std::fmt::Debug for Describe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Describe")
            .field("runtime", &self.runtime.name())
            .finish_non_exhaustive()
    }
}

impl Describe {
    pub fn new(runtime: Arc<dyn Runtime>) -> Arc<Self> {
        let descriptor = Descriptor::new("describe").handles(
            OpInfo::new("describe", "Produce a machine- and human-readable catalog of the operations supported by this endpoint.")
                .optional("verbose?", "Include informational detail for each operation.")
                .returns("ops", "Map of operation names to operation metadata.")
                .returns("versions", "Map of version component names to version maps."),
        );

        Arc::new(Self {
            descriptor,
            runtime,
        })
    }
}

fn arg_map(args: &[(String, String)]) -> Item {
    Item::Map(
        args.iter()
            .map(|(name, doc)| (name.clone(), Item::Str(doc.clone())))
            .collect(),
    )
}

fn op_entry(info: &OpInfo, verbose: bool) -> Item {
    if !verbose {
        return Item::Map(BTreeMap::new());
    }

    let mut entry = BTreeMap::new();
    entry.insert("doc".to_string(), Item::Str(info.doc.clone()));
    entry.insert("requires".to_string(), arg_map(&info.requires));
    entry.insert("optional".to_string(), arg_map(&info.optional));
    entry.insert("returns".to_string(), arg_map(&info.returns));
    Item::Map(entry)
}

/// Break `major.minor.incremental` out of a version string, keeping the
/// whole thing under `version-string`.
fn version_map(version: &str) -> Item {
    let mut entry = BTreeMap::new();
    let numeric = version.split(['.', '-']).take(3);
    for (name, part) in ["major", "minor", "incremental"].into_iter().zip(numeric) {
        let item = match part.parse::<i64>() {
            Ok(int) => Item::Int(int),
            Err(_) => Item::Str(part.to_string()),
        };
        entry.insert(name.to_string(), item);
    }
    entry.insert(
        "version-string".to_string(),
        Item::Str(version.to_string()),
    );
    Item::Map(entry)
}

impl Middleware for Describe {
    fn descriptor(&self) -> &Descriptor {
        &self.descriptor
    }

    fn handle<'a>(
        &'a self,
        req: Request,
        next: Next<'a>,
    ) -> BoxFuture<'a, Result<(), HandlerError>> {
        Box::pin(async move {
            if req.msg.op() != Some(ops::DESCRIBE) {
                return next.run(req).await;
            }

            let verbose = req.msg.get("verbose?").is_some();

            let ops_map: BTreeMap<String, Item> = req
                .ops
                .iter()
                .map(|(op, info)| (op.clone(), op_entry(info, verbose)))
                .collect();

            let mut versions = BTreeMap::new();
            versions.insert(
                env!("CARGO_PKG_NAME").to_string(),
                version_map(env!("CARGO_PKG_VERSION")),
            );
            versions.insert(
                self.runtime.name().to_string(),
                version_map(self.runtime.version()),
            );

            req.respond(
                req.reply()
                    .with("ops", Item::Map(ops_map))
                    .with("versions", Item::Map(versions))
                    .with("aux", Item::Map(BTreeMap::new()))
                    .with_status([Status::Done]),
            );
            Ok(())
        })
    }
}
