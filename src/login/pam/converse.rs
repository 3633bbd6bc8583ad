use libc::{c_char, c_int, c_void, calloc, free, memcpy, size_t};
use pam_sys::{PamConversation, PamMessage, PamMessageStyle, PamResponse, PamReturnCode};
use std::{error::Error, ffi::CStr, mem};
use zeroize::Zeroize;

#[derive(Debug)]
pub struct ConversationError;

impl<E: Error> From<E> for ConversationError {
    fn from(value: E) -> Self {
        // We cannot pass any error context to pam
        tracing::debug!("PAM conversation failed: {value}");
        Self
    }
}

impl From<ConversationError> for PamReturnCode {
    fn from(_: ConversationError) -> Self {
        PamReturnCode::CONV_ERR
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MessageLevel {
    Error,
    Info,
}

/// Front end of a PAM conversation
pub trait PamDisplay {
    fn prompt(&self, text: &str, show: bool) -> Result<String, ConversationError>;
    fn message(&self, text: &str, level: MessageLevel) -> Result<(), ConversationError>;
}

unsafe fn to_cstr(mut s: String) -> *mut c_char {
    unsafe {
        let a = calloc(1, s.len() + 1) as *mut c_char;
        if !a.is_null() {
            memcpy(a as *mut c_void, s.as_ptr() as *const c_void, s.len());
        }
        s.zeroize();
        a
    }
}

pub struct PamConversationHandler {
    display: Box<dyn PamDisplay>,
}

impl PamConversationHandler {
    pub fn with_display(display: impl PamDisplay + 'static) -> Box<Self> {
        Box::new(Self {
            display: Box::new(display),
        })
    }

    fn handle(
        &self,
        message: &PamMessage,
        response_sender: &mut PamResponse,
    ) -> Result<(), ConversationError> {
        let text = unsafe { CStr::from_ptr(message.msg) }.to_str()?;

        let response = match PamMessageStyle::from(message.msg_style) {
            PamMessageStyle::PROMPT_ECHO_ON => self.display.prompt(text, true)?,
            PamMessageStyle::PROMPT_ECHO_OFF => self.display.prompt(text, false)?,
            PamMessageStyle::ERROR_MSG => {
                return self.display.message(text, MessageLevel::Error);
            }
            PamMessageStyle::TEXT_INFO => {
                return self.display.message(text, MessageLevel::Info);
            }
        };

        response_sender.resp = unsafe { to_cstr(response) };
        if response_sender.resp.is_null() {
            return Err(ConversationError);
        }

        Ok(())
    }

    extern "C" fn converse(
        num_msg: c_int,
        msg: *mut *mut PamMessage,
        out_resp: *mut *mut PamResponse,
        appdata_ptr: *mut c_void,
    ) -> c_int {
        // allocate space for responses
        let resp = unsafe {
            calloc(num_msg as usize, mem::size_of::<PamResponse>() as size_t) as *mut PamResponse
        };
        if resp.is_null() {
            return PamReturnCode::BUF_ERR as c_int;
        }

        let handler = unsafe { &*(appdata_ptr as *const Self) };

        let mut pam_ret = PamReturnCode::SUCCESS as c_int;
        for i in 0..num_msg as isize {
            // Linux-PAM passes an array of pointers to messages
            let message: &PamMessage = unsafe { &**(msg.offset(i)) };
            let response: &mut PamResponse = unsafe { &mut *(resp.offset(i)) };

            if let Err(error) = handler.handle(message, response) {
                pam_ret = PamReturnCode::from(error) as c_int;
                break;
            }
        }

        if pam_ret != PamReturnCode::SUCCESS as c_int {
            for i in 0..num_msg as isize {
                let r: &mut PamResponse = unsafe { &mut *(resp.offset(i)) };
                if !r.resp.is_null() {
                    unsafe {
                        let len = libc::strlen(r.resp);
                        std::ptr::write_bytes(r.resp, 0, len);
                        free(r.resp as *mut c_void);
                    }
                }
            }

            unsafe { free(resp as *mut c_void) };
        } else {
            unsafe { *out_resp = resp };
        }

        pam_ret
    }

    /// The returned conversation points at `self`,
    /// which must not move for as long as PAM may call it.
    pub fn as_pam_conversation(&self) -> PamConversation {
        PamConversation {
            conv: Some(Self::converse),
            data_ptr: self as *const Self as *mut c_void,
        }
    }
}
