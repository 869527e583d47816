/// Helper macro for reading locked items
///
/// Must be used inside a function returning [`crate::Result`]; a poisoned lock turns into
/// [`crate::Error::LockError`].
///
/// ```rust, ignore
///  let images = read_lock!(self.images);
///  println!("{} images loaded", images.len());
/// ```
macro_rules! read_lock {
    ($rwlock:expr) => {
        $rwlock.read().map_err(|_| crate::Error::LockError)?
    };
}

/// Helper macro for writing to locked items
///
/// Must be used inside a function returning [`crate::Result`]; a poisoned lock turns into
/// [`crate::Error::LockError`].
///
/// ```rust, ignore
///  let mut images = write_lock!(self.images);
///  images.push(image);
/// ```
macro_rules! write_lock {
    ($rwlock:expr) => {
        $rwlock.write().map_err(|_| crate::Error::LockError)?
    };
}
