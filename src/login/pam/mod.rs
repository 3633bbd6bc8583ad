mod converse;
pub use converse::{ConversationError, MessageLevel, PamDisplay};

use anyhow::{Result, anyhow};
use libc::{c_char, c_int, c_void};
use pam_sys::{PamFlag, PamHandle, PamItemType, PamReturnCode, raw};
use tracing::{debug, warn};

use std::{
    ffi::{CStr, CString},
    ptr,
};

use crate::{
    environment::Env,
    error::LoginError,
    login::auth::{AuthRequest, Authenticator, Transaction},
};

use converse::PamConversationHandler;

pub struct PAM {
    handle: *mut PamHandle,
    last_code: c_int,
    session_open: bool,

    // PAM holds a pointer into this for the whole transaction
    _conversation: Box<PamConversationHandler>,
}

macro_rules! pam_call {
    ($self:ident.$method:ident( $($args:expr),* )) => {{
        let code = unsafe { raw::$method($self.handle, $($args),*) };
        $self.handle_ret(code, stringify!($method))
    }};
}

pub enum CredentialsOP {
    Establish,
    Delete,
}

impl PAM {
    pub fn new(
        service_name: &str,
        display: impl PamDisplay + 'static,
        user: Option<&str>,
    ) -> Result<Self> {
        let service = CString::new(service_name)?;
        let user = user.map(CString::new).transpose()?;

        let conversation = PamConversationHandler::with_display(display);
        let pam_conversation = conversation.as_pam_conversation();

        let mut handle: *mut PamHandle = ptr::null_mut();

        let code = unsafe {
            raw::pam_start(
                service.as_ptr(),
                user.as_ref().map_or(ptr::null(), |user| user.as_ptr()),
                &pam_conversation,
                &mut handle as *mut *mut PamHandle as *mut *const PamHandle,
            )
        };

        match PamReturnCode::from(code) {
            PamReturnCode::SUCCESS if !handle.is_null() => Ok(Self {
                handle,
                last_code: code,
                session_open: false,
                _conversation: conversation,
            }),
            err => Err(LoginError::Authentication(format!("pam_start: {err:?}")).into()),
        }
    }

    fn handle_ret(&mut self, ret: c_int, fn_name: &str) -> Result<()> {
        self.last_code = ret;
        match PamReturnCode::from(ret) {
            PamReturnCode::SUCCESS => Ok(()),
            err => Err(anyhow!("pam error at `{fn_name}`: {err:?}")),
        }
    }

    fn flags(silent: bool) -> c_int {
        if silent {
            PamFlag::SILENT as c_int
        } else {
            PamFlag::NONE as c_int
        }
    }

    pub fn authenticate(&mut self, silent: bool) -> Result<()> {
        pam_call!(self.pam_authenticate(Self::flags(silent)))
            .map_err(|e| LoginError::Authentication(e.to_string()).into())
    }

    pub fn assert_account_is_valid(&mut self, silent: bool) -> Result<()> {
        pam_call!(self.pam_acct_mgmt(Self::flags(silent)))
            .map_err(|e| LoginError::Authentication(e.to_string()).into())
    }

    pub fn credentials(&mut self, op: CredentialsOP) -> Result<()> {
        let flag = match op {
            CredentialsOP::Establish => PamFlag::ESTABLISH_CRED,
            CredentialsOP::Delete => PamFlag::DELETE_CRED,
        };
        pam_call!(self.pam_setcred(flag as c_int))
    }

    pub fn open_session(&mut self, silent: bool) -> Result<()> {
        pam_call!(self.pam_open_session(Self::flags(silent)))?;
        self.session_open = true;
        Ok(())
    }

    pub fn close_session(&mut self, silent: bool) -> Result<()> {
        self.session_open = false;
        pam_call!(self.pam_close_session(Self::flags(silent)))
    }

    pub fn set_item(&mut self, item: PamItemType, value: &str) -> Result<()> {
        let s = CString::new(value)?;
        pam_call!(self.pam_set_item(item as c_int, s.as_ptr() as *const c_void))
    }

    pub fn get_username(&mut self) -> Result<String> {
        let mut item: *const c_void = ptr::null();
        pam_call!(self.pam_get_item(PamItemType::USER as c_int, &mut item))?;

        if item.is_null() {
            return Err(LoginError::Authentication("PAM did not report a user".into()).into());
        }

        let user = unsafe { CStr::from_ptr(item as *const c_char) };
        Ok(user.to_str()?.to_string())
    }

    pub fn get_env(&mut self) -> Result<Env> {
        let list = unsafe { raw::pam_getenvlist(self.handle) };
        if list.is_null() {
            return Err(anyhow!("pam error at `pam_getenvlist`"));
        }

        let mut pairs = Vec::new();
        unsafe {
            let mut cursor = list;
            while !(*cursor).is_null() {
                pairs.push(CStr::from_ptr(*cursor).to_bytes().to_vec());
                libc::free(*cursor as *mut c_void);
                cursor = cursor.add(1);
            }
            libc::free(list as *mut c_void);
        }

        Ok(Env::from_pairs(pairs.iter().map(Vec::as_slice)))
    }
}

impl Drop for PAM {
    fn drop(&mut self) {
        if self.session_open
            && let Err(e) = self.close_session(true)
        {
            warn!("Failed to close PAM session: {e}");
        }

        unsafe { raw::pam_end(self.handle, self.last_code) };
        debug!("PAM handle released");
    }
}

/// Authentication backend talking to the system PAM stack
pub struct PamAuthenticator {
    service: String,
}

impl PamAuthenticator {
    pub fn new(service: &str) -> Self {
        Self {
            service: service.to_string(),
        }
    }
}

impl Authenticator for PamAuthenticator {
    type Transaction = PamTransaction;

    fn begin(
        &self,
        request: &AuthRequest,
        display: impl PamDisplay + 'static,
    ) -> Result<PamTransaction> {
        let mut pam = PAM::new(&self.service, display, request.user.as_deref())?;

        pam.set_item(PamItemType::TTY, &format!("tty{}", request.tty))?;

        pam.authenticate(true)?;
        pam.assert_account_is_valid(true)?;
        pam.credentials(CredentialsOP::Establish)?;
        pam.open_session(true)?;

        Ok(PamTransaction { pam: Some(pam) })
    }
}

pub struct PamTransaction {
    pam: Option<PAM>,
}

impl PamTransaction {
    fn pam(&mut self) -> Result<&mut PAM> {
        self.pam.as_mut().ok_or(anyhow!("PAM transaction already closed"))
    }
}

impl Transaction for PamTransaction {
    fn username(&mut self) -> Result<String> {
        self.pam()?.get_username()
    }

    fn env(&mut self) -> Result<Env> {
        self.pam()?.get_env()
    }

    fn close(mut self) -> Result<()> {
        let Some(mut pam) = self.pam.take() else {
            return Ok(());
        };

        let closed = pam.close_session(true);
        let deleted = pam.credentials(CredentialsOP::Delete);
        drop(pam);

        closed.and(deleted)
    }
}
