//! Thin safe wrapper over the raw `pam_sys` transaction handle. Each
//! method maps a non-`PAM_SUCCESS` return onto `Error` through
//! `error::PamCode`, so callers just use `?`.

use std::pin::Pin;

use pam_sys::{PamFlag, PamHandle, PamItemType, PamReturnCode};

use super::converse::Converse;
use super::ffi::{make_conversation, PamConvHandlerWrapper};
use crate::error::{Error, PamCode, Result};

fn check(code: PamReturnCode) -> Result<()> {
    if code == PamReturnCode::SUCCESS {
        Ok(())
    } else {
        Err(Error::from(PamCode(code)))
    }
}

pub struct PamSession<'a> {
    handle: *mut PamHandle,
    // Keeps the conversation wrapper (and the trait object it boxes)
    // alive for as long as `handle` might call back into it.
    _conv: Pin<Box<PamConvHandlerWrapper<'a>>>,
}

impl<'a> PamSession<'a> {
    pub fn start(service: &str, user: &str, conv: Pin<Box<dyn Converse + 'a>>) -> Result<PamSession<'a>> {
        let mut wrapper = Box::pin(PamConvHandlerWrapper { handler: conv });
        let conversation = make_conversation(&mut wrapper);

        let mut handle: *mut PamHandle = std::ptr::null_mut();
        let code = pam_sys::start(service, Some(user), &conversation, &mut handle);
        check(code)?;

        Ok(PamSession {
            handle,
            _conv: wrapper,
        })
    }

    pub fn authenticate(&mut self, flags: PamFlag) -> Result<()> {
        check(pam_sys::authenticate(self.handle, flags))
    }

    pub fn acct_mgmt(&mut self, flags: PamFlag) -> Result<()> {
        check(pam_sys::acct_mgmt(self.handle, flags))
    }

    pub fn setcred(&mut self, flags: PamFlag) -> Result<()> {
        check(pam_sys::setcred(self.handle, flags))
    }

    pub fn open_session(&mut self, flags: PamFlag) -> Result<()> {
        check(pam_sys::open_session(self.handle, flags))
    }

    pub fn close_session(&mut self, flags: PamFlag) -> Result<()> {
        check(pam_sys::close_session(self.handle, flags))
    }

    pub fn set_item(&mut self, item: PamItemType, value: &str) -> Result<()> {
        check(pam_sys::set_item_str(self.handle, item, value))
    }

    pub fn putenv(&mut self, name_value: &str) -> Result<()> {
        check(pam_sys::putenv(self.handle, name_value))
    }

    pub fn getenvlist(&mut self) -> Vec<String> {
        pam_sys::getenvlist(self.handle)
    }

    pub fn get_user(&mut self) -> Result<String> {
        pam_sys::get_user(self.handle, None).map_err(|code| Error::from(PamCode(code)))
    }
}

impl<'a> Drop for PamSession<'a> {
    fn drop(&mut self) {
        // Best-effort: a failed pam_end at this point can't be acted on.
        let _ = pam_sys::end(self.handle, PamReturnCode::SUCCESS);
    }
}

unsafe impl<'a> Send for PamSession<'a> {}
