// pgvault: PostgreSQL WAL archive and backup agent.
// Copyright 2022 Stephanie Aelmore.
// Copyright 2015-2025 Martin Pool.

// This program is free software; you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation; either version 2 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.

//! Unix implementation of file ownership.

use std::io;
use std::os::unix::fs::MetadataExt;
use std::path::Path;
use std::sync::Mutex;

use lazy_static::lazy_static;
use nix::errno::Errno;
use nix::unistd;
use tracing::debug;
use uzers::{Groups, Users, UsersCache};

use super::Owner;
use crate::{Error, Result};

lazy_static! {
    static ref USERS_CACHE: Mutex<UsersCache> = Mutex::new(UsersCache::new());
}

impl From<&std::fs::Metadata> for Owner {
    fn from(mdata: &std::fs::Metadata) -> Self {
        let users_cache = USERS_CACHE.lock().unwrap();
        let user: Option<String> = users_cache
            .get_user_by_uid(mdata.uid())
            .and_then(|user| user.name().to_str().map(String::from));
        let group: Option<String> = users_cache
            .get_group_by_gid(mdata.gid())
            .and_then(|group| group.name().to_str().map(String::from));
        Self { user, group }
    }
}

/// Set the owner of a file by user and group name.
///
/// Unknown names are an error. Lack of permission to change ownership is
/// not, because workers normally don't run as root.
pub(crate) fn set_owner(owner: &Owner, path: &Path) -> Result<()> {
    let users_cache = USERS_CACHE.lock().unwrap();
    let uid_opt = match &owner.user {
        Some(user) => Some(unistd::Uid::from_raw(
            users_cache
                .get_user_by_name(user)
                .ok_or_else(|| Error::FileWrite {
                    path: path.to_owned(),
                    source: io::Error::other(format!("unknown user {user:?}")),
                })?
                .uid(),
        )),
        None => None,
    };
    let gid_opt = match &owner.group {
        Some(group) => Some(unistd::Gid::from_raw(
            users_cache
                .get_group_by_name(group)
                .ok_or_else(|| Error::FileWrite {
                    path: path.to_owned(),
                    source: io::Error::other(format!("unknown group {group:?}")),
                })?
                .gid(),
        )),
        None => None,
    };
    drop(users_cache);
    match unistd::chown(path, uid_opt, gid_opt) {
        Ok(()) => Ok(()),
        Err(Errno::EPERM) => {
            debug!("Not permitted to set owner of {path:?} to {owner}");
            Ok(())
        }
        Err(errno) => Err(Error::FileWrite {
            path: path.to_owned(),
            source: io::Error::from_raw_os_error(errno as i32),
        }),
    }
}
