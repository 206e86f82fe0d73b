//! C ABI over a process-wide [`Bridge`] backed by the headless engine.
//!
//! A `WebEngineHandle` carries the handle token in a pointer-sized value and is
//! never dereferenced, so stale or garbage handles are rejected with
//! `InvalidHandle` instead of touching freed memory. Every function except
//! `webengine_create` returns a [`WebEngineStatus`].

use crate::bridge::{Bridge, EngineHandle};
use crate::callbacks::{LoadingCallback, NavigationCallback, ProgressCallback, RenderCallback, TitleCallback, UrlCallback};
use crate::cookies::copy_nul_terminated;
use crate::dispatch::frame::Frame;
use crate::engine::headless::HeadlessEngineFactory;
use crate::engine::{KeyEvent, NavigationState, TouchEvent, TouchKind};
use crate::errors::BridgeError;
use crate::script::{ScriptCompletion, ScriptResult};
use lazy_static::lazy_static;
use std::ffi::{c_void, CStr, CString};
use std::os::raw::{c_char, c_int};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

pub type WebEngineHandle = *mut c_void;

pub type WebEngineLoadingCallback = Option<extern "C" fn(is_loading: bool)>;
pub type WebEngineProgressCallback = Option<extern "C" fn(progress: f32)>;
pub type WebEngineUrlCallback = Option<extern "C" fn(url: *const c_char)>;
pub type WebEngineTitleCallback = Option<extern "C" fn(title: *const c_char)>;
pub type WebEngineNavigationCallback = Option<extern "C" fn(can_go_back: bool, can_go_forward: bool)>;
pub type WebEngineRenderCallback = Option<extern "C" fn(pixels: *const c_void, width: c_int, height: c_int)>;
pub type WebEngineJsResultCallback = Option<extern "C" fn(result: *const c_char)>;

#[repr(C)]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum WebEngineStatus {
    Ok = 0,
    InvalidHandle = 1,
    AllocationFailure = 2,
    BufferTooSmall = 3,
    Timeout = 4,
    InvalidArgument = 5,
}

impl From<&BridgeError> for WebEngineStatus {
    fn from(e: &BridgeError) -> Self {
        match e {
            BridgeError::InvalidHandle => WebEngineStatus::InvalidHandle,
            BridgeError::AllocationFailure(_) => WebEngineStatus::AllocationFailure,
            BridgeError::BufferTooSmall { .. } => WebEngineStatus::BufferTooSmall,
            BridgeError::Timeout(_) => WebEngineStatus::Timeout,
            BridgeError::InvalidArgument(_) | BridgeError::Config(_) => WebEngineStatus::InvalidArgument,
        }
    }
}

impl<T> From<Result<T, BridgeError>> for WebEngineStatus {
    fn from(res: Result<T, BridgeError>) -> Self {
        match res {
            Ok(_) => WebEngineStatus::Ok,
            Err(e) => {
                log::debug!("FFI call failed: {e}");
                WebEngineStatus::from(&e)
            }
        }
    }
}

lazy_static! {
    static ref BRIDGE: Option<Bridge> = match Bridge::new(None, Box::new(HeadlessEngineFactory::default())) {
        Ok(bridge) => Some(bridge),
        Err(e) => {
            log::error!("Cannot start the engine bridge: {e}");
            None
        }
    };
}

fn bridge() -> Result<&'static Bridge, BridgeError> {
    BRIDGE
        .as_ref()
        .ok_or_else(|| BridgeError::AllocationFailure("engine bridge unavailable".into()))
}

/// `None` when the token does not fit in a pointer (32-bit targets with
/// generations past the first).
fn to_ffi(handle: EngineHandle) -> Option<WebEngineHandle> {
    usize::try_from(handle.to_raw()).ok().map(|raw| raw as WebEngineHandle)
}

/// Hands a new handle to C. A handle that cannot be encoded is destroyed
/// again so that it does not stay registered without an owner.
fn publish(
    bridge: &Bridge,
    handle: EngineHandle,
    encode: impl FnOnce(EngineHandle) -> Option<WebEngineHandle>,
) -> WebEngineHandle {
    if let Some(ptr) = encode(handle) {
        return ptr;
    }
    log::error!("{handle} cannot be represented as a C handle");
    if let Err(e) = bridge.destroy(handle) {
        log::error!("Cannot destroy unrepresentable {handle}: {e}");
    }
    std::ptr::null_mut()
}

fn from_ffi(handle: WebEngineHandle) -> Result<EngineHandle, BridgeError> {
    EngineHandle::from_raw(handle as usize as u64).ok_or(BridgeError::InvalidHandle)
}

/// Runs `f` against the global bridge and the decoded handle. A panic is
/// reported as `InvalidArgument` and never unwinds into the caller.
fn call(handle: WebEngineHandle, f: impl FnOnce(&Bridge, EngineHandle) -> Result<(), BridgeError>) -> WebEngineStatus {
    match catch_unwind(AssertUnwindSafe(|| bridge().and_then(|b| f(b, from_ffi(handle)?)))) {
        Ok(res) => res.into(),
        Err(_) => {
            log::error!("Panic caught at the C boundary");
            WebEngineStatus::InvalidArgument
        }
    }
}

/// # Safety
/// `ptr` must be null or point to a NUL-terminated string that outlives `'a`.
unsafe fn c_str<'a>(ptr: *const c_char, what: &str) -> Result<&'a str, BridgeError> {
    if ptr.is_null() {
        return Err(BridgeError::InvalidArgument(format!("{what} is null")));
    }
    CStr::from_ptr(ptr)
        .to_str()
        .map_err(|_| BridgeError::InvalidArgument(format!("{what} is not UTF-8")))
}

fn c_string(s: &str) -> CString {
    CString::new(s.replace('\0', "")).unwrap_or_default()
}

/// Creates an engine instance. Returns NULL on failure.
#[no_mangle]
pub extern "C" fn webengine_create() -> WebEngineHandle {
    match catch_unwind(|| bridge().and_then(|b| b.create().map(|h| publish(b, h, to_ffi)))) {
        Ok(Ok(ptr)) => ptr,
        Ok(Err(e)) => {
            log::error!("webengine_create failed: {e}");
            std::ptr::null_mut()
        }
        Err(_) => {
            log::error!("Panic caught in webengine_create");
            std::ptr::null_mut()
        }
    }
}

#[no_mangle]
pub extern "C" fn webengine_destroy(handle: WebEngineHandle) -> WebEngineStatus {
    call(handle, |b, h| b.destroy(h))
}

/// # Safety
/// `url` must be null or a valid NUL-terminated string.
#[no_mangle]
pub unsafe extern "C" fn webengine_load_url(handle: WebEngineHandle, url: *const c_char) -> WebEngineStatus {
    call(handle, |b, h| b.load_url(h, c_str(url, "url")?))
}

#[no_mangle]
pub extern "C" fn webengine_go_back(handle: WebEngineHandle) -> WebEngineStatus {
    call(handle, |b, h| b.go_back(h))
}

#[no_mangle]
pub extern "C" fn webengine_go_forward(handle: WebEngineHandle) -> WebEngineStatus {
    call(handle, |b, h| b.go_forward(h))
}

#[no_mangle]
pub extern "C" fn webengine_reload(handle: WebEngineHandle) -> WebEngineStatus {
    call(handle, |b, h| b.reload(h))
}

#[no_mangle]
pub extern "C" fn webengine_stop_loading(handle: WebEngineHandle) -> WebEngineStatus {
    call(handle, |b, h| b.stop_loading(h))
}

/// Evaluates `script`. `callback` receives exactly one result string: the JSON
/// value on success, `{"error": ..., "kind": ...}` on failure.
///
/// # Safety
/// `script` must be null or a valid NUL-terminated string.
#[no_mangle]
pub unsafe extern "C" fn webengine_execute_javascript(
    handle: WebEngineHandle,
    script: *const c_char,
    callback: WebEngineJsResultCallback,
) -> WebEngineStatus {
    call(handle, |b, h| {
        let script = c_str(script, "script")?;
        let completion = callback.map(|cb| {
            Box::new(move |result: &ScriptResult| {
                let payload = c_string(&result.to_payload());
                cb(payload.as_ptr());
            }) as ScriptCompletion
        });
        b.execute_javascript(h, script, completion).map(|_| ())
    })
}

/// `kind`: 0 = down, 1 = move, 2 = up, 3 = cancel.
#[no_mangle]
pub extern "C" fn webengine_send_touch_event(handle: WebEngineHandle, kind: c_int, x: f32, y: f32) -> WebEngineStatus {
    call(handle, |b, h| {
        let kind = TouchKind::from_raw(kind)
            .ok_or_else(|| BridgeError::InvalidArgument(format!("touch event type {kind}")))?;
        b.send_touch_event(h, TouchEvent { kind, x, y })
    })
}

#[no_mangle]
pub extern "C" fn webengine_send_key_event(handle: WebEngineHandle, key_code: c_int, is_down: bool) -> WebEngineStatus {
    call(handle, |b, h| b.send_key_event(h, KeyEvent::new(key_code, is_down)))
}

#[no_mangle]
pub extern "C" fn webengine_set_viewport_size(handle: WebEngineHandle, width: c_int, height: c_int) -> WebEngineStatus {
    call(handle, |b, h| {
        let (Ok(w), Ok(ht)) = (u32::try_from(width), u32::try_from(height)) else {
            return Err(BridgeError::InvalidArgument(format!("viewport {width}x{height}")));
        };
        b.set_viewport_size(h, w, ht)
    })
}

#[no_mangle]
pub extern "C" fn webengine_set_loading_callback(
    handle: WebEngineHandle,
    callback: WebEngineLoadingCallback,
) -> WebEngineStatus {
    call(handle, |b, h| b.set_loading_callback(h, callback.map(|cb| Arc::new(move |v: bool| cb(v)) as LoadingCallback)))
}

#[no_mangle]
pub extern "C" fn webengine_set_progress_callback(
    handle: WebEngineHandle,
    callback: WebEngineProgressCallback,
) -> WebEngineStatus {
    call(handle, |b, h| b.set_progress_callback(h, callback.map(|cb| Arc::new(move |p: f32| cb(p)) as ProgressCallback)))
}

#[no_mangle]
pub extern "C" fn webengine_set_url_callback(handle: WebEngineHandle, callback: WebEngineUrlCallback) -> WebEngineStatus {
    call(handle, |b, h| {
        b.set_url_callback(
            h,
            callback.map(|cb| {
                Arc::new(move |url: &str| {
                    let url = c_string(url);
                    cb(url.as_ptr());
                }) as UrlCallback
            }),
        )
    })
}

#[no_mangle]
pub extern "C" fn webengine_set_title_callback(
    handle: WebEngineHandle,
    callback: WebEngineTitleCallback,
) -> WebEngineStatus {
    call(handle, |b, h| {
        b.set_title_callback(
            h,
            callback.map(|cb| {
                Arc::new(move |title: &str| {
                    let title = c_string(title);
                    cb(title.as_ptr());
                }) as TitleCallback
            }),
        )
    })
}

#[no_mangle]
pub extern "C" fn webengine_set_navigation_callback(
    handle: WebEngineHandle,
    callback: WebEngineNavigationCallback,
) -> WebEngineStatus {
    call(handle, |b, h| {
        b.set_navigation_callback(
            h,
            callback.map(|cb| Arc::new(move |s: NavigationState| cb(s.can_go_back, s.can_go_forward)) as NavigationCallback),
        )
    })
}

/// The pixel pointer is valid only until the callback returns.
#[no_mangle]
pub extern "C" fn webengine_set_render_callback(
    handle: WebEngineHandle,
    callback: WebEngineRenderCallback,
) -> WebEngineStatus {
    call(handle, |b, h| {
        b.set_render_callback(
            h,
            callback.map(|cb| {
                Arc::new(move |frame: &Frame<'_>| {
                    let (Ok(w), Ok(ht)) = (c_int::try_from(frame.width), c_int::try_from(frame.height)) else {
                        log::warn!("Frame {}x{} does not fit the C ABI", frame.width, frame.height);
                        return;
                    };
                    cb(frame.pixels.as_ptr().cast(), w, ht);
                }) as RenderCallback
            }),
        )
    })
}

/// # Safety
/// `domain`, `name` and `value` must be null or valid NUL-terminated strings.
#[no_mangle]
pub unsafe extern "C" fn webengine_set_cookie(
    handle: WebEngineHandle,
    domain: *const c_char,
    name: *const c_char,
    value: *const c_char,
) -> WebEngineStatus {
    call(handle, |b, h| {
        b.set_cookie(h, c_str(domain, "domain")?, c_str(name, "name")?, c_str(value, "value")?)
    })
}

/// Writes the cookies for `domain` as a NUL-terminated `name=value; ...`
/// string into `buffer`. Never writes more than `buffer_size` bytes. When the
/// string does not fit, a truncated terminated copy is written and
/// `BufferTooSmall` is returned.
///
/// # Safety
/// `domain` must be null or a valid NUL-terminated string. `buffer` must be
/// null or valid for writes of `buffer_size` bytes.
#[no_mangle]
pub unsafe extern "C" fn webengine_get_cookies(
    handle: WebEngineHandle,
    domain: *const c_char,
    buffer: *mut c_char,
    buffer_size: c_int,
) -> WebEngineStatus {
    call(handle, |b, h| {
        let domain = c_str(domain, "domain")?;
        let size = usize::try_from(buffer_size)
            .map_err(|_| BridgeError::InvalidArgument(format!("buffer size {buffer_size}")))?;
        if buffer.is_null() && size > 0 {
            return Err(BridgeError::InvalidArgument("buffer is null".into()));
        }

        let cookies = b.get_cookies(h, domain)?;
        let buf: &mut [u8] = if size == 0 {
            &mut []
        } else {
            std::slice::from_raw_parts_mut(buffer.cast::<u8>(), size)
        };
        copy_nul_terminated(&cookies, buf).map(|_| ())
    })
}

#[no_mangle]
pub extern "C" fn webengine_clear_cookies(handle: WebEngineHandle) -> WebEngineStatus {
    call(handle, |b, h| b.clear_cookies(h))
}

/// # Safety
/// `user_agent` must be null or a valid NUL-terminated string.
#[no_mangle]
pub unsafe extern "C" fn webengine_set_user_agent(handle: WebEngineHandle, user_agent: *const c_char) -> WebEngineStatus {
    call(handle, |b, h| b.set_user_agent(h, c_str(user_agent, "user agent")?))
}

#[no_mangle]
pub extern "C" fn webengine_enable_javascript(handle: WebEngineHandle, enable: bool) -> WebEngineStatus {
    call(handle, |b, h| b.enable_javascript(h, enable))
}

#[no_mangle]
pub extern "C" fn webengine_enable_images(handle: WebEngineHandle, enable: bool) -> WebEngineStatus {
    call(handle, |b, h| b.enable_images(h, enable))
}
