//! Handlers of the built-in control messages every node answers on `control://{node_id}`.
use std::convert::Infallible;

use crate::{
    handler::HandlerTableBuilder,
    model::{
        control::{
            AssignWorkMessage, HeartbeatMessage, PingMessage, Pong, PongMessage,
            ReleaseWorkMessage,
        },
        message::json::Json,
        NodeId,
    },
    protocol::runtime::RuntimeRef,
};

pub(crate) fn register_control_handlers(
    builder: HandlerTableBuilder,
    node_id: NodeId,
    runtime: RuntimeRef,
) -> HandlerTableBuilder {
    let on_heartbeat = {
        let runtime = runtime.clone();
        move |Json(beat): HeartbeatMessage| {
            let runtime = runtime.clone();
            async move {
                let runtime = runtime
                    .upgrade()
                    .ok_or_else(|| crate::Error::runtime_stopped("record heartbeat"))?;
                tracing::trace!(peer = %beat.node_id, service = %beat.service_name, "heartbeat");
                runtime
                    .with_storage("record peer heartbeat", || {
                        runtime.durable().heartbeat(beat.node_id, beat.time)
                    })
                    .await
            }
        }
    };
    let on_ping = move |Json(ping): PingMessage| async move {
        Ok::<PongMessage, Infallible>(Json(Pong {
            node_id,
            sent_at: ping.sent_at,
        }))
    };
    let on_assign = {
        let runtime = runtime.clone();
        move |Json(assign): AssignWorkMessage| {
            let runtime = runtime.clone();
            async move {
                let runtime = runtime
                    .upgrade()
                    .ok_or_else(|| crate::Error::runtime_stopped("assign work"))?;
                tracing::info!(node = %node_id, work_id = %assign.work_id, "work assigned");
                runtime.set_assignment(assign.work_id, true);
                Ok::<(), crate::Error>(())
            }
        }
    };
    let on_release = move |Json(release): ReleaseWorkMessage| {
        let runtime = runtime.clone();
        async move {
            let runtime = runtime
                .upgrade()
                .ok_or_else(|| crate::Error::runtime_stopped("release work"))?;
            tracing::info!(node = %node_id, work_id = %release.work_id, "work released");
            runtime.set_assignment(release.work_id, false);
            Ok::<(), crate::Error>(())
        }
    };
    builder
        .with_handler(on_heartbeat)
        .with_handler(on_ping)
        .with_handler(on_assign)
        .with_handler(on_release)
}
