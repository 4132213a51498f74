//! RPC dispatcher
//!
//! Decodes a request, checks its exact shape against the command's request
//! header, runs the handler and builds the response. Every command is
//! followed by displaying the pending error, if a handler left one.
//!
//! Requests are handled one at a time; callers serialize `handle_request`.

use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;

use plg_hal::{Hal, MenuEntry, PluginMenu, SwapStore};
use plg_ipc::command::*;
use plg_ipc::result::{self, ResultCode};
use plg_ipc::{make_header, IpcHeader, LOADER_VERSION};
use plg_kernel_core::Handle;

use crate::error::LoaderError;
use crate::journal::LifecycleEvent;
use crate::lifecycle::PluginLoader;
use crate::params::{PluginLoadParameters, SwapSettings};

/// A translated parameter.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum IpcDescriptor {
    /// Static or mapped buffer
    Buffer(Vec<u8>),
    /// Moved or copied handle
    Handle(Handle),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IpcRequest {
    pub header: u32,
    /// Normal parameter words
    pub params: Vec<u32>,
    /// Translate parameters, two words each on the wire
    pub descriptors: Vec<IpcDescriptor>,
}

impl IpcRequest {
    pub fn new(header: u32, params: Vec<u32>, descriptors: Vec<IpcDescriptor>) -> Self {
        Self {
            header,
            params,
            descriptors,
        }
    }

    /// Whether the request carries exactly the words `expected` announces.
    fn matches(&self, expected: u32) -> bool {
        let hdr = IpcHeader::decode(expected);
        self.header == expected
            && self.params.len() == usize::from(hdr.normal_words)
            && self.descriptors.len() * 2 == usize::from(hdr.translate_words)
    }

    fn buffer(&self, index: usize) -> Result<&[u8], LoaderError> {
        match self.descriptors.get(index) {
            Some(IpcDescriptor::Buffer(b)) => Ok(b),
            _ => Err(LoaderError::MalformedRequest),
        }
    }

    fn handle(&self, index: usize) -> Result<Handle, LoaderError> {
        match self.descriptors.get(index) {
            Some(IpcDescriptor::Handle(h)) => Ok(*h),
            _ => Err(LoaderError::MalformedRequest),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IpcResponse {
    pub header: u32,
    pub result: ResultCode,
    /// Normal words after the result
    pub values: Vec<u32>,
    pub descriptors: Vec<IpcDescriptor>,
}

impl IpcResponse {
    fn status(command_id: u16, result: ResultCode) -> Self {
        Self {
            header: make_header(command_id, 1, 0),
            result,
            values: Vec::new(),
            descriptors: Vec::new(),
        }
    }

    fn ok(command_id: u16) -> Self {
        Self::status(command_id, result::SUCCESS)
    }

    fn with_value(command_id: u16, value: u32) -> Self {
        Self {
            header: make_header(command_id, 2, 0),
            result: result::SUCCESS,
            values: alloc::vec![value],
            descriptors: Vec::new(),
        }
    }

    fn with_descriptor(command_id: u16, descriptor: IpcDescriptor) -> Self {
        Self {
            header: make_header(command_id, 1, 2),
            result: result::SUCCESS,
            values: Vec::new(),
            descriptors: alloc::vec![descriptor],
        }
    }
}

/// The loader's command surface.
pub struct LoaderService<H: Hal, S: SwapStore> {
    loader: Arc<PluginLoader<H, S>>,
}

impl<H: Hal, S: SwapStore> LoaderService<H, S> {
    pub fn new(loader: Arc<PluginLoader<H, S>>) -> Self {
        Self { loader }
    }

    pub fn loader(&self) -> &Arc<PluginLoader<H, S>> {
        &self.loader
    }

    /// Handle one request.
    pub fn handle_request(&self, req: IpcRequest) -> IpcResponse {
        let command_id = IpcHeader::decode(req.header).command_id;

        let response = match command_id {
            CMD_LOAD_PLUGIN => self.checked(&req, REQ_LOAD_PLUGIN, |r| self.handle_load_plugin(r)),
            CMD_IS_ENABLED => self.checked(&req, REQ_IS_ENABLED, |_| {
                Ok(IpcResponse::with_value(CMD_IS_ENABLED, u32::from(self.loader.is_enabled())))
            }),
            CMD_SET_ENABLED => self.checked(&req, REQ_SET_ENABLED, |r| {
                self.loader.set_enabled(r.params[0] != 0);
                Ok(IpcResponse::ok(CMD_SET_ENABLED))
            }),
            CMD_SET_LOAD_PARAMS => self.checked(&req, REQ_SET_LOAD_PARAMS, |r| self.handle_set_load_params(r)),
            CMD_DISPLAY_MENU => self.checked(&req, REQ_DISPLAY_MENU, |r| self.handle_display_menu(r)),
            CMD_DISPLAY_MESSAGE => self.checked(&req, REQ_DISPLAY_MESSAGE, |r| {
                let title = c_string(r.buffer(0)?)?;
                let body = c_string(r.buffer(1)?)?;
                self.loader.hal().display_message(&title, &body);
                Ok(IpcResponse::ok(CMD_DISPLAY_MESSAGE))
            }),
            CMD_DISPLAY_ERROR => self.checked(&req, REQ_DISPLAY_ERROR, |r| {
                let title = c_string(r.buffer(0)?)?;
                let body = c_string(r.buffer(1)?)?;
                self.loader.hal().display_error(&title, r.params[0], &body);
                Ok(IpcResponse::ok(CMD_DISPLAY_ERROR))
            }),
            CMD_GET_VERSION => self.checked(&req, REQ_GET_VERSION, |_| {
                Ok(IpcResponse::with_value(CMD_GET_VERSION, LOADER_VERSION))
            }),
            CMD_GET_ARBITER => self.checked(&req, REQ_GET_ARBITER, |_| {
                Ok(IpcResponse::with_descriptor(
                    CMD_GET_ARBITER,
                    IpcDescriptor::Handle(self.loader.arbiter()),
                ))
            }),
            CMD_GET_PLUGIN_PATH => self.checked(&req, REQ_GET_PLUGIN_PATH, |r| self.handle_get_plugin_path(r)),
            CMD_SET_UI_BLOCK => self.checked(&req, REQ_SET_UI_BLOCK, |r| {
                self.loader.set_ui_blocked(r.params[0] != 0);
                Ok(IpcResponse::ok(CMD_SET_UI_BLOCK))
            }),
            CMD_SET_SWAP_PARAMS => self.checked(&req, REQ_SET_SWAP_PARAMS, |r| self.handle_set_swap_params(r)),
            CMD_SET_EXE_LOAD_PARAMS => {
                self.checked(&req, REQ_SET_EXE_LOAD_PARAMS, |r| self.handle_set_exe_load_params(r))
            }
            _ => {
                self.loader.hal().debug_write(&alloc::format!(
                    "[plgldr:rpc] unknown command {:#x}",
                    req.header
                ));
                IpcResponse::status(0, LoaderError::NotImplemented.result_code())
            }
        };

        self.loader.record(LifecycleEvent::Command {
            id: command_id,
            code: response.result,
        });
        self.loader.display_pending_error();
        self.loader.run_pending_tasks();
        response
    }

    /// Run `handler` if `req` has exactly the shape of `expected`.
    fn checked(
        &self,
        req: &IpcRequest,
        expected: u32,
        handler: impl FnOnce(&IpcRequest) -> Result<IpcResponse, LoaderError>,
    ) -> IpcResponse {
        let command_id = IpcHeader::decode(expected).command_id;
        if !req.matches(expected) {
            self.loader.hal().debug_write(&alloc::format!(
                "[plgldr:rpc] malformed request {:#010x} for command {}",
                req.header,
                command_id
            ));
            return IpcResponse::status(0, LoaderError::MalformedRequest.result_code());
        }
        match handler(req) {
            Ok(resp) => resp,
            Err(LoaderError::MalformedRequest) => {
                IpcResponse::status(0, LoaderError::MalformedRequest.result_code())
            }
            Err(e) => IpcResponse::status(command_id, e.result_code()),
        }
    }

    fn handle_load_plugin(&self, req: &IpcRequest) -> Result<IpcResponse, LoaderError> {
        let target = req.handle(0)?;
        self.loader.load(target)?;
        Ok(IpcResponse::ok(CMD_LOAD_PLUGIN))
    }

    fn handle_set_load_params(&self, req: &IpcRequest) -> Result<IpcResponse, LoaderError> {
        let path = c_string(req.buffer(0)?)?;
        let config = words(req.buffer(1)?)?;
        let params = PluginLoadParameters::new(req.params[0], req.params[1], path, config)?;
        self.loader.with_context(|ctx| {
            ctx.params = params;
            ctx.has_params = true;
        });
        Ok(IpcResponse::ok(CMD_SET_LOAD_PARAMS))
    }

    /// Buffers: title, entry states (one byte each), NUL-separated labels,
    /// NUL-separated hints.
    fn handle_display_menu(&self, req: &IpcRequest) -> Result<IpcResponse, LoaderError> {
        let count = req.params[0] as usize;
        let title = c_string(req.buffer(0)?)?;
        let states = req.buffer(1)?;
        let labels = split_strings(req.buffer(2)?)?;
        let hints = split_strings(req.buffer(3)?)?;
        if labels.len() < count || states.len() < count {
            return Err(LoaderError::TooLarge);
        }

        let mut menu = PluginMenu {
            title,
            entries: labels
                .into_iter()
                .take(count)
                .enumerate()
                .map(|(i, label)| MenuEntry {
                    label,
                    hint: hints.get(i).cloned().unwrap_or_default(),
                    state: states[i],
                })
                .collect(),
        };
        self.loader.hal().display_menu(&mut menu)?;

        let mut updated = states.to_vec();
        for (slot, entry) in updated.iter_mut().zip(menu.entries.iter()) {
            *slot = entry.state;
        }
        Ok(IpcResponse::with_descriptor(CMD_DISPLAY_MENU, IpcDescriptor::Buffer(updated)))
    }

    fn handle_get_plugin_path(&self, req: &IpcRequest) -> Result<IpcResponse, LoaderError> {
        let capacity = req.buffer(0)?.len();
        let path = self.loader.plugin_path();
        if path.len() + 1 > capacity {
            return Err(LoaderError::TooLarge);
        }
        let mut out = alloc::vec![0u8; capacity];
        out[..path.len()].copy_from_slice(path.as_bytes());
        Ok(IpcResponse::with_descriptor(CMD_GET_PLUGIN_PATH, IpcDescriptor::Buffer(out)))
    }

    /// Params: save routine, load routine. Buffers: 4-byte little-endian
    /// bound, swap filename.
    fn handle_set_swap_params(&self, req: &IpcRequest) -> Result<IpcResponse, LoaderError> {
        let default_filename = self.loader.config().default_swap_filename.clone();
        self.loader.with_context(|ctx| ctx.memory.reset_swap_settings());

        let bound = match req.buffer(0)? {
            [a, b, c, d] => u32::from_le_bytes([*a, *b, *c, *d]) as usize,
            _ => return Err(LoaderError::MalformedRequest),
        };
        let filename = c_string(req.buffer(1)?)?;
        let settings = SwapSettings::new(req.params[0], req.params[1], bound, &filename, &default_filename)?;

        self.loader.with_context(|ctx| ctx.memory.set_swap_settings(settings));
        self.loader.hal().invalidate_instruction_cache();
        Ok(IpcResponse::ok(CMD_SET_SWAP_PARAMS))
    }

    fn handle_set_exe_load_params(&self, req: &IpcRequest) -> Result<IpcResponse, LoaderError> {
        self.loader.with_context(|ctx| ctx.exe_load.reset());
        let context = words(req.buffer(0)?)?;
        let entry = req.params[0];
        self.loader.with_context(|ctx| ctx.exe_load.configure(entry, context))?;
        self.loader.hal().invalidate_instruction_cache();
        Ok(IpcResponse::ok(CMD_SET_EXE_LOAD_PARAMS))
    }
}

/// Decode a NUL-terminated (or unterminated) UTF-8 string.
fn c_string(buf: &[u8]) -> Result<String, LoaderError> {
    let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    core::str::from_utf8(&buf[..end])
        .map(String::from)
        .map_err(|_| LoaderError::MalformedRequest)
}

/// Split a buffer of NUL-separated strings.
fn split_strings(buf: &[u8]) -> Result<Vec<String>, LoaderError> {
    let trimmed = match buf.iter().rposition(|&b| b != 0) {
        Some(last) => &buf[..=last],
        None => return Ok(Vec::new()),
    };
    trimmed
        .split(|&b| b == 0)
        .map(|s| {
            core::str::from_utf8(s)
                .map(String::from)
                .map_err(|_| LoaderError::MalformedRequest)
        })
        .collect()
}

/// Decode little-endian words. Oversize blobs fail with `TooLarge`.
fn words(buf: &[u8]) -> Result<Vec<u32>, LoaderError> {
    if buf.len() % 4 != 0 {
        return Err(LoaderError::MalformedRequest);
    }
    if buf.len() / 4 > CONFIG_WORDS {
        return Err(LoaderError::TooLarge);
    }
    Ok(buf
        .chunks_exact(4)
        .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_c_string_stops_at_nul() {
        assert_eq!(c_string(b"title\0junk").unwrap(), "title");
        assert_eq!(c_string(b"plain").unwrap(), "plain");
        assert_eq!(c_string(&[0xFF, 0]), Err(LoaderError::MalformedRequest));
    }

    #[test]
    fn test_split_strings_ignores_trailing_nuls() {
        assert_eq!(split_strings(b"a\0bc\0\0\0").unwrap(), ["a", "bc"]);
        assert!(split_strings(b"\0\0").unwrap().is_empty());
    }

    #[test]
    fn test_words_limits() {
        assert_eq!(words(&[1, 0, 0, 0, 2, 0, 0, 0]).unwrap(), [1, 2]);
        assert_eq!(words(&[1, 0, 0]), Err(LoaderError::MalformedRequest));
        assert_eq!(words(&[0; (CONFIG_WORDS + 1) * 4]), Err(LoaderError::TooLarge));
    }

    #[test]
    fn test_shape_check_counts_descriptor_words() {
        let req = IpcRequest::new(REQ_LOAD_PLUGIN, Vec::new(), alloc::vec![IpcDescriptor::Handle(Handle(5))]);
        assert!(req.matches(REQ_LOAD_PLUGIN));
        let req = IpcRequest::new(REQ_LOAD_PLUGIN, alloc::vec![1], alloc::vec![IpcDescriptor::Handle(Handle(5))]);
        assert!(!req.matches(REQ_LOAD_PLUGIN));
    }
}
