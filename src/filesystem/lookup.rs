use log::error;

use crate::structs::*;
use crate::Error;

use super::{Filesystem, NodeRef};

const FORBIDDEN: &[char] = &['/', '\\', ':', '*', '?', '"', '<', '>', '|'];

/// Path components with empty and `.` ones dropped
fn components(path: &str) -> impl Iterator<Item = &str> {
    path.split('/')
        .filter(|component| !component.is_empty() && *component != ".")
}

fn encode(name: &str) -> Result<Vec<u16>, Error> {
    let units: Vec<u16> = name.encode_utf16().collect();
    if units.len() > NAME_MAX {
        error!("Name '{name}' is longer than {NAME_MAX} units");
        return Err(Error::NameTooLong);
    }
    Ok(units)
}

fn is_allowed(name: &str) -> bool {
    !name
        .chars()
        .any(|c| ('\u{1}'..='\u{1f}').contains(&c) || FORBIDDEN.contains(&c))
}

impl Filesystem {
    /// Child of `dir` whose name matches `name` ignoring case
    fn lookup_name(&mut self, dir: NodeId, name: &[u16]) -> Result<NodeId, Error> {
        if !self.cache[dir].is_directory() {
            return Err(Error::NotDirectory);
        }
        self.cache_directory(dir)?;
        self.cache
            .children(dir)
            .into_iter()
            .find(|&child| self.upcase.names_equal(&self.cache[child].name, name))
            .ok_or(Error::NotFound)
    }

    fn lookup_id(&mut self, path: &str) -> Result<NodeId, Error> {
        let mut node = self.root_id;
        for component in components(path) {
            node = self.lookup_name(node, &encode(component)?)?;
        }
        Ok(node)
    }

    /// Resolve an absolute path, `/` being the root directory
    pub fn lookup(&mut self, path: &str) -> Result<NodeRef, Error> {
        let id = self.lookup_id(path)?;
        Ok(self.cache.handle(id))
    }

    /// Split `path` into its parent directory, the node it names if any and the final name
    pub(crate) fn split(&mut self, path: &str) -> Result<(NodeId, Option<NodeId>, Vec<u16>), Error> {
        let components: Vec<&str> = components(path).collect();
        let Some((last, parents)) = components.split_last() else {
            error!("Path '{path}' has no final component");
            return Err(Error::InvalidArgument);
        };
        let mut dir = self.root_id;
        for component in parents {
            dir = self.lookup_name(dir, &encode(component)?)?;
        }
        if !self.cache[dir].is_directory() {
            return Err(Error::NotDirectory);
        }
        if !is_allowed(last) {
            error!("Name '{last}' contains forbidden characters");
            return Err(Error::InvalidName);
        }
        let name = encode(last)?;
        let existing = match self.lookup_name(dir, &name) {
            Ok(node) => Some(node),
            Err(Error::NotFound) => None,
            Err(e) => return Err(e),
        };
        Ok((dir, existing, name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filesystem::testing::{mount_image, ImageBuilder};

    fn populated() -> Filesystem {
        let mut fs = mount_image(ImageBuilder::default().build());
        fs.mkdir("/Music").unwrap();
        fs.mkdir("/Music/Albums").unwrap();
        fs.mknod("/Music/Albums/track.flac").unwrap();
        fs.mknod("/notes").unwrap();
        fs
    }

    #[test]
    fn nested_paths() {
        let mut fs = populated();
        let track = fs.lookup("/Music/Albums/track.flac").unwrap();
        assert_eq![fs.node(&track).name(), "track.flac"];
        let same = fs.lookup("music//ALBUMS/./Track.FLAC").unwrap();
        assert_eq![track, same];
        let root = fs.lookup("/").unwrap();
        assert_eq![root, fs.root()];
        assert_eq![fs.lookup("").unwrap(), fs.root()];
    }

    #[test]
    fn lookup_failures() {
        let mut fs = populated();
        assert![matches![fs.lookup("/Music/missing"), Err(Error::NotFound)]];
        assert![matches![fs.lookup("/notes/inner"), Err(Error::NotDirectory)]];
        let long = "x".repeat(NAME_MAX + 1);
        assert![matches![fs.lookup(&format!("/{long}")), Err(Error::NameTooLong)]];
    }

    #[test]
    fn split_paths() {
        let mut fs = populated();
        let albums = fs.lookup("/Music/Albums").unwrap();
        let track = fs.lookup("/Music/Albums/track.flac").unwrap();
        let (dir, existing, name) = fs.split("/music/albums/TRACK.flac").unwrap();
        assert_eq![dir, albums.id()];
        assert_eq![existing, Some(track.id())];
        assert_eq![String::from_utf16(&name).unwrap(), "TRACK.flac"];

        let (dir, existing, _) = fs.split("/new").unwrap();
        assert_eq![dir, fs.root().id()];
        assert_eq![existing, None];
    }

    #[test]
    fn split_rejects_bad_names() {
        let mut fs = populated();
        assert![matches![fs.split("/"), Err(Error::InvalidArgument)]];
        assert![matches![fs.split("/what?"), Err(Error::InvalidName)]];
        assert![matches![fs.split("/tab\tname"), Err(Error::InvalidName)]];
        assert![matches![fs.split("/a:b"), Err(Error::InvalidName)]];
        assert![matches![fs.split("/missing/name"), Err(Error::NotFound)]];
        assert![matches![fs.split("/notes/name"), Err(Error::NotDirectory)]];
        let long = "y".repeat(NAME_MAX + 1);
        assert![matches![fs.split(&format!("/{long}")), Err(Error::NameTooLong)]];
        assert![fs.split(&format!("/{}", "y".repeat(NAME_MAX))).is_ok()];
    }
}
