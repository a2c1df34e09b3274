use crate::cursor::Cursor;
use crate::entry::ItemEntry;
use crate::mark::XMark;

/// An iterator over the present entries in a range of an [`XArray`].
///
/// The typical way to obtain a `Range` is to call [`XArray::range`].
///
/// [`XArray`]: crate::XArray
/// [`XArray::range`]: crate::XArray::range
pub struct Range<'a, I, M>
where
    I: ItemEntry + Send + Sync,
    M: Into<XMark>,
{
    cursor: Cursor<'a, I, M>,
    end: u64,
}

impl<'a, I: ItemEntry + Send + Sync, M: Into<XMark>> Range<'a, I, M> {
    pub(crate) fn new(cursor: Cursor<'a, I, M>, end: u64) -> Self {
        Range { cursor, end }
    }
}

impl<'a, I: ItemEntry + Send + Sync + 'a, M: Into<XMark>> Iterator for Range<'a, I, M> {
    type Item = (u64, I::Ref<'a>);

    fn next(&mut self) -> Option<Self::Item> {
        if self.cursor.index() >= self.end {
            return None;
        }
        self.cursor.find(self.end - 1)
    }
}

/// An iterator over the marked entries in a range of an [`XArray`].
///
/// The typical way to obtain a `MarkedRange` is to call
/// [`XArray::marked_range`].
///
/// [`XArray`]: crate::XArray
/// [`XArray::marked_range`]: crate::XArray::marked_range
pub struct MarkedRange<'a, I, M>
where
    I: ItemEntry + Send + Sync,
    M: Into<XMark>,
{
    cursor: Cursor<'a, I, M>,
    end: u64,
    mark: XMark,
}

impl<'a, I: ItemEntry + Send + Sync, M: Into<XMark>> MarkedRange<'a, I, M> {
    pub(crate) fn new(cursor: Cursor<'a, I, M>, end: u64, mark: XMark) -> Self {
        MarkedRange { cursor, end, mark }
    }
}

impl<'a, I: ItemEntry + Send + Sync + 'a, M: Into<XMark>> Iterator for MarkedRange<'a, I, M> {
    type Item = (u64, I::Ref<'a>);

    fn next(&mut self) -> Option<Self::Item> {
        if self.cursor.index() >= self.end {
            return None;
        }
        self.cursor.find_marked_raw(self.end - 1, self.mark)
    }
}
