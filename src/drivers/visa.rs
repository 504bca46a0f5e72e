use std::ffi::CString;
use std::os::raw::c_char;

use libloading::Library;
use log::{debug, warn};
use once_cell::sync::OnceCell;

use crate::drivers::{EisError, InstrumentChannel};

type ViSession = u32;
type ViStatus = i32;
type ViAttr = u32;
type ViAttrState = usize;

const VI_NULL: u32 = 0;
const VI_ERROR_INV_OBJECT: ViStatus = 0xBFFF_000E_u32 as ViStatus;
const VI_ERROR_TMO: ViStatus = 0xBFFF_0015_u32 as ViStatus;
const VI_ERROR_CONN_LOST: ViStatus = 0xBFFF_00A6_u32 as ViStatus;
/// More data is pending: the read filled the caller's buffer.
const VI_SUCCESS_MAX_CNT: ViStatus = 0x3FFF_0006;
const VI_ATTR_TMO_VALUE: ViAttr = 0x3FFF_001A;
const TIMEOUT_MS: ViAttrState = 60_000;
const READ_CHUNK: usize = 64 * 1024;

#[cfg(target_os = "windows")]
const VISA_LIBRARY: &str = "visa64.dll";
#[cfg(target_os = "macos")]
const VISA_LIBRARY: &str = "/Library/Frameworks/VISA.framework/VISA";
#[cfg(not(any(target_os = "windows", target_os = "macos")))]
const VISA_LIBRARY: &str = "libvisa.so";

struct VisaApi {
    #[allow(dead_code)]
    lib: Library,
    open_default_rm: unsafe extern "C" fn(*mut ViSession) -> ViStatus,
    open: unsafe extern "C" fn(ViSession, *const c_char, u32, u32, *mut ViSession) -> ViStatus,
    close: unsafe extern "C" fn(ViSession) -> ViStatus,
    write: unsafe extern "C" fn(ViSession, *const u8, u32, *mut u32) -> ViStatus,
    read: unsafe extern "C" fn(ViSession, *mut u8, u32, *mut u32) -> ViStatus,
    set_attribute: unsafe extern "C" fn(ViSession, ViAttr, ViAttrState) -> ViStatus,
}
impl VisaApi {
    fn load() -> Result<Self, EisError> {
        let lib = unsafe { Library::new(VISA_LIBRARY) }
            .map_err(|e| EisError::Connection(format!("cannot load {VISA_LIBRARY}: {e}")))?;
        // Safety: signatures follow the VPP-4.3.2 C binding.
        unsafe {
            Ok(Self {
                open_default_rm: *lib.get(b"viOpenDefaultRM\0").map_err(missing)?,
                open: *lib.get(b"viOpen\0").map_err(missing)?,
                close: *lib.get(b"viClose\0").map_err(missing)?,
                write: *lib.get(b"viWrite\0").map_err(missing)?,
                read: *lib.get(b"viRead\0").map_err(missing)?,
                set_attribute: *lib.get(b"viSetAttribute\0").map_err(missing)?,
                lib,
            })
        }
    }
    fn instance() -> Result<&'static VisaApi, EisError> {
        static API: OnceCell<VisaApi> = OnceCell::new();
        API.get_or_try_init(Self::load)
    }
    fn check(status: ViStatus, call: &'static str) -> Result<ViStatus, EisError> {
        match status {
            s if s >= 0 => Ok(s),
            VI_ERROR_INV_OBJECT | VI_ERROR_TMO | VI_ERROR_CONN_LOST => Err(EisError::ChannelClosed),
            _ => Err(EisError::Visa { call, status }),
        }
    }
}

fn missing(err: libloading::Error) -> EisError {
    EisError::Connection(format!("VISA symbol missing: {err}"))
}

/// Session on a VISA resource such as `USB0::0x0957::0x1518::TW57160002::0::INSTR`.
pub struct VisaChannel {
    api: &'static VisaApi,
    resource_manager: ViSession,
    session: ViSession,
}
impl VisaChannel {
    pub fn open(resource: &str) -> Result<Self, EisError> {
        let api = VisaApi::instance()?;
        let name = CString::new(resource)
            .map_err(|_| EisError::Connection(format!("resource {resource:?} contains NUL")))?;
        let mut resource_manager: ViSession = 0;
        VisaApi::check(
            unsafe { (api.open_default_rm)(&mut resource_manager as *mut ViSession) },
            "viOpenDefaultRM",
        )?;
        let mut session: ViSession = 0;
        let opened = VisaApi::check(
            unsafe {
                (api.open)(
                    resource_manager,
                    name.as_ptr(),
                    VI_NULL,
                    VI_NULL,
                    &mut session as *mut ViSession,
                )
            },
            "viOpen",
        );
        if let Err(err) = opened {
            unsafe { (api.close)(resource_manager) };
            return Err(err);
        }
        let channel = Self {
            api,
            resource_manager,
            session,
        };
        VisaApi::check(
            unsafe { (api.set_attribute)(session, VI_ATTR_TMO_VALUE, TIMEOUT_MS) },
            "viSetAttribute",
        )?;
        debug!("opened VISA session {session} on {resource}");
        Ok(channel)
    }
    fn write_all(&mut self, mut bytes: &[u8]) -> Result<(), EisError> {
        while !bytes.is_empty() {
            let mut written: u32 = 0;
            VisaApi::check(
                unsafe {
                    (self.api.write)(
                        self.session,
                        bytes.as_ptr(),
                        bytes.len() as u32,
                        &mut written as *mut u32,
                    )
                },
                "viWrite",
            )?;
            if written == 0 {
                return Err(EisError::ChannelClosed);
            }
            bytes = &bytes[written as usize..];
        }
        Ok(())
    }
    fn read_message(&mut self) -> Result<Vec<u8>, EisError> {
        let mut out = Vec::new();
        let mut chunk = vec![0u8; READ_CHUNK];
        loop {
            let mut count: u32 = 0;
            let status = VisaApi::check(
                unsafe {
                    (self.api.read)(
                        self.session,
                        chunk.as_mut_ptr(),
                        chunk.len() as u32,
                        &mut count as *mut u32,
                    )
                },
                "viRead",
            )?;
            out.extend_from_slice(&chunk[..count as usize]);
            if status != VI_SUCCESS_MAX_CNT {
                return Ok(out);
            }
        }
    }
}

impl InstrumentChannel for VisaChannel {
    fn send(&mut self, command: &str) -> Result<(), EisError> {
        let mut line = Vec::with_capacity(command.len() + 1);
        line.extend_from_slice(command.as_bytes());
        line.push(b'\n');
        self.write_all(&line)
    }
    fn write_block(&mut self, header: &str, payload: &[u8]) -> Result<(), EisError> {
        let mut message = Vec::with_capacity(header.len() + payload.len());
        message.extend_from_slice(header.as_bytes());
        message.extend_from_slice(payload);
        self.write_all(&message)
    }
    fn read_text(&mut self) -> Result<String, EisError> {
        let bytes = self.read_message()?;
        Ok(String::from_utf8_lossy(&bytes).trim().to_string())
    }
    fn read_raw(&mut self) -> Result<Vec<u8>, EisError> {
        self.read_message()
    }
}

impl Drop for VisaChannel {
    fn drop(&mut self) {
        let session = unsafe { (self.api.close)(self.session) };
        let manager = unsafe { (self.api.close)(self.resource_manager) };
        if session < 0 || manager < 0 {
            warn!("closing VISA session returned {session:#x}/{manager:#x}");
        }
    }
}
