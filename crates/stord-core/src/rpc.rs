//! JSON-lines RPC handler.
//!
//! Reads one `RpcRequest` per line and writes one `RpcResponse` per line:
//!
//!   stord rpc < requests.jsonl
//!
//! A malformed line gets an error response and the loop moves on to the
//! next one; only I/O failures on the streams end the session.

use std::io::{self, BufRead, Write};
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{json, Value};
use stord_protocol::ops::{
    names, CreateAppDataResponse, FixupAppDataResponse, FreeCacheResponse,
    IsQuotaSupportedRequest, IsQuotaSupportedResponse, DumpResponse, SizeResponse,
};
use stord_protocol::{RpcError, RpcRequest, RpcResponse, PROTOCOL_MAX, PROTOCOL_MIN};
use tracing::{debug, warn};

use crate::identity::Caller;
use crate::service::StorageService;

/// Protocol version reported when a request could not be parsed.
const PROTOCOL_VERSION_UNKNOWN: i32 = 0;

/// RPC front end over one [`StorageService`].
pub struct RpcHandler {
    service: Arc<StorageService>,
}

impl RpcHandler {
    pub fn new(service: Arc<StorageService>) -> Self {
        Self { service }
    }

    /// Serve stdin to stdout until end of input.
    pub fn run(&self) -> io::Result<()> {
        self.run_with_io(&mut io::stdin().lock(), &mut io::stdout().lock())
    }

    /// Serve `reader` to `writer` until end of input (for testing).
    pub fn run_with_io<R: BufRead, W: Write>(&self, reader: &mut R, writer: &mut W) -> io::Result<()> {
        let mut line = String::new();
        loop {
            line.clear();
            if reader.read_line(&mut line)? == 0 {
                return Ok(());
            }
            if line.trim().is_empty() {
                continue;
            }
            let response = self.handle_line(&line);
            self.write_response(writer, &response)?;
        }
    }

    /// Answer one request line.
    pub fn handle_line(&self, line: &str) -> RpcResponse {
        let request: RpcRequest = match serde_json::from_str(line) {
            Ok(request) => request,
            Err(e) => {
                return RpcResponse::error(
                    PROTOCOL_VERSION_UNKNOWN,
                    String::new(),
                    RpcError::invalid_request(format!("invalid JSON: {}", e)),
                );
            }
        };

        if let Err(e) = self.validate_protocol_version(&request) {
            return RpcResponse::error(request.protocol_version, request.request_id, e);
        }

        debug!(op = %request.op, request_id = %request.request_id, caller = request.caller_uid, "dispatching");
        match self.dispatch(&request) {
            Ok(payload) => RpcResponse::success(request.protocol_version, request.request_id, payload),
            Err(e) => {
                warn!(op = %request.op, code = ?e.code, message = %e.message, "request failed");
                RpcResponse::error(request.protocol_version, request.request_id, e)
            }
        }
    }

    fn validate_protocol_version(&self, request: &RpcRequest) -> Result<(), RpcError> {
        if request.protocol_version < PROTOCOL_MIN || request.protocol_version > PROTOCOL_MAX {
            return Err(RpcError::unsupported_protocol(
                request.protocol_version,
                PROTOCOL_MIN,
                PROTOCOL_MAX,
            ));
        }
        Ok(())
    }

    fn dispatch(&self, request: &RpcRequest) -> Result<Value, RpcError> {
        let service = &self.service;
        let caller = Caller::new(request.caller_uid);

        match request.op.as_str() {
            names::CREATE_APP_DATA => {
                let ce_data_inode = service.create_app_data(caller, &payload(request)?)?;
                to_value(&CreateAppDataResponse { ce_data_inode })
            }
            names::DESTROY_APP_DATA => {
                service.destroy_app_data(caller, &payload(request)?)?;
                Ok(json!({}))
            }
            names::MIGRATE_APP_DATA => {
                service.migrate_app_data(caller, &payload(request)?)?;
                Ok(json!({}))
            }
            names::CLEAR_APP_DATA => {
                service.clear_app_data(caller, &payload(request)?)?;
                Ok(json!({}))
            }
            names::FIXUP_APP_DATA => {
                let report = service.fixup_app_data(caller, &payload(request)?)?;
                to_value(&FixupAppDataResponse {
                    visited: report.visited,
                    fixed: report.fixed,
                    ignored: report.ignored,
                })
            }
            names::RESTORECON_APP_DATA => {
                service.restorecon_app_data(caller, &payload(request)?)?;
                Ok(json!({}))
            }
            names::MOVE_COMPLETE_APP => {
                service.move_complete_app(caller, &payload(request)?)?;
                Ok(json!({}))
            }
            names::CLEAR_APP_PROFILES => {
                service.clear_app_profiles(caller, &payload(request)?)?;
                Ok(json!({}))
            }
            names::DESTROY_APP_PROFILES => {
                service.destroy_app_profiles(caller, &payload(request)?)?;
                Ok(json!({}))
            }
            names::CREATE_USER_DATA => {
                service.create_user_data(caller, &payload(request)?)?;
                Ok(json!({}))
            }
            names::DESTROY_USER_DATA => {
                service.destroy_user_data(caller, &payload(request)?)?;
                Ok(json!({}))
            }
            names::GET_APP_SIZE => {
                let size = service.get_app_size(&payload(request)?)?;
                to_value(&SizeResponse::from(size))
            }
            names::GET_USER_SIZE => {
                let size = service.get_user_size(&payload(request)?)?;
                to_value(&SizeResponse::from(size))
            }
            names::GET_EXTERNAL_SIZE => {
                let size = service.get_external_size(&payload(request)?)?;
                to_value(&SizeResponse::from(size))
            }
            names::SET_APP_QUOTA => {
                service.set_app_quota(caller, &payload(request)?)?;
                Ok(json!({}))
            }
            names::FREE_CACHE => {
                let report = service.free_cache(caller, &payload(request)?)?;
                to_value(&FreeCacheResponse {
                    free_bytes: report.free_after,
                    cleared_bytes: report.cleared,
                    purged_items: report.purged.len(),
                })
            }
            names::INVALIDATE_MOUNTS => {
                service.invalidate_mounts(caller)?;
                Ok(json!({}))
            }
            names::IS_QUOTA_SUPPORTED => {
                let query: IsQuotaSupportedRequest = payload(request)?;
                let supported = service.is_quota_supported(query.volume_uuid.as_deref())?;
                to_value(&IsQuotaSupportedResponse { supported })
            }
            names::DUMP => to_value(&DumpResponse {
                text: service.dump(),
            }),
            op => Err(RpcError::unknown_operation(op)),
        }
    }

    fn write_response<W: Write>(&self, writer: &mut W, response: &RpcResponse) -> io::Result<()> {
        let json = serde_json::to_string(response)
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
        writeln!(writer, "{}", json)?;
        writer.flush()?;
        Ok(())
    }
}

/// Decode the operation payload.
fn payload<T: DeserializeOwned>(request: &RpcRequest) -> Result<T, RpcError> {
    serde_json::from_value(request.payload.clone())
        .map_err(|e| RpcError::invalid_request(format!("invalid payload for {}: {}", request.op, e)))
}

fn to_value<T: Serialize>(value: &T) -> Result<Value, RpcError> {
    serde_json::to_value(value)
        .map_err(|e| RpcError::invalid_request(format!("failed to encode response: {}", e)))
}
