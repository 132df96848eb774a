use std::collections::HashSet;
use std::path::{Path, PathBuf};
use walkdir::{DirEntry, WalkDir};

/// A candidate file found while walking a root.
#[derive(Debug)]
pub enum Discovered {
    /// Image file, identified by its canonical path.
    Image(PathBuf),
    /// Entry that could not be read while walking.
    Unreadable { path: PathBuf, error: std::io::Error },
}

/// Case-insensitive extension allow-list check.
pub fn has_image_extension(path: &Path, extensions: &[String]) -> bool {
    path.extension()
        .map(|ext| ext.to_string_lossy().to_lowercase())
        .map(|ext| extensions.iter().any(|e| e.to_lowercase() == ext))
        .unwrap_or(false)
}

/// Lazily walk `root` yielding image files in a stable (name-sorted) order.
///
/// Symlinked directories are followed when `follow_links` is set; each
/// canonical directory is entered at most once, so symlink cycles and
/// multiple links to the same directory do not repeat work.
pub fn walk_images<'a>(
    root: &Path,
    extensions: &'a [String],
    follow_links: bool,
) -> impl Iterator<Item = Discovered> + 'a {
    let mut visited_dirs: HashSet<PathBuf> = HashSet::new();

    WalkDir::new(root)
        .follow_links(follow_links)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(move |entry| enter_once(entry, &mut visited_dirs))
        .filter_map(move |entry| match entry {
            Ok(entry) => {
                if !entry.file_type().is_file() || !has_image_extension(entry.path(), extensions) {
                    return None;
                }
                match entry.path().canonicalize() {
                    Ok(path) => Some(Discovered::Image(path)),
                    Err(error) => Some(Discovered::Unreadable {
                        path: entry.path().to_path_buf(),
                        error,
                    }),
                }
            }
            Err(err) => {
                // walkdir reports loops it detects itself as errors; those
                // directories were already visited, so they are not failures.
                if err.loop_ancestor().is_some() {
                    tracing::debug!(error = %err, "Skipping symlink loop");
                    return None;
                }
                let path = err.path().map(Path::to_path_buf).unwrap_or_default();
                let error = err
                    .into_io_error()
                    .unwrap_or_else(|| std::io::Error::other("walk error"));
                Some(Discovered::Unreadable { path, error })
            }
        })
}

fn enter_once(entry: &DirEntry, visited: &mut HashSet<PathBuf>) -> bool {
    if !entry.file_type().is_dir() {
        return true;
    }
    match entry.path().canonicalize() {
        Ok(canonical) => visited.insert(canonical),
        Err(_) => true,
    }
}
