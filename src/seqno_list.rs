use anyhow::bail;
use bytes::{Buf, BytesMut};
use std::fmt::{Display, Formatter};

use crate::headers::{get_varlong, put_varlong};
use crate::seqno::Seqno;

/// A compact ordered set of seqnos, used as the payload of an XMIT_REQ.
///
/// Consecutive seqnos are collapsed into runs, so the wire size is driven by
/// the number of gaps rather than the number of missing messages.
///
/// Wire layout: varlong run count, then per run a varlong first seqno and a
/// varlong run length (>= 1). Runs are ascending and disjoint.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SeqnoList {
    runs: Vec<(Seqno, u64)>,
}

impl SeqnoList {
    pub fn new() -> SeqnoList {
        SeqnoList { runs: Vec::new() }
    }

    /// Appends a seqno. Seqnos must be appended in strictly ascending order;
    /// an out-of-order append is ignored.
    pub fn append(&mut self, seqno: Seqno) {
        if let Some((start, len)) = self.runs.last_mut() {
            let next = *start + *len;
            if seqno == next {
                *len += 1;
                return;
            }
            if seqno < next {
                return;
            }
        }
        self.runs.push((seqno, 1));
    }

    pub fn is_empty(&self) -> bool {
        self.runs.is_empty()
    }

    /// Total number of seqnos in the set.
    pub fn size(&self) -> u64 {
        self.runs.iter().map(|(_, len)| len).sum()
    }

    pub fn last(&self) -> Option<Seqno> {
        self.runs.last().map(|&(start, len)| start + (len - 1))
    }

    /// Drops all seqnos strictly greater than `bound`.
    pub fn remove_higher_than(&mut self, bound: Seqno) {
        self.runs.retain_mut(|(start, len)| {
            if *start > bound {
                return false;
            }
            let last = *start + (*len - 1);
            if last > bound {
                *len = (bound - *start) + 1;
            }
            true
        });
    }

    pub fn iter(&self) -> impl Iterator<Item = Seqno> + '_ {
        self.runs
            .iter()
            .flat_map(|&(start, len)| (0..len).map(move |i| start + i))
    }

    pub fn ser(&self, buf: &mut BytesMut) {
        put_varlong(buf, self.runs.len() as u64);
        for &(start, len) in &self.runs {
            put_varlong(buf, start.to_raw());
            put_varlong(buf, len);
        }
    }

    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<SeqnoList> {
        let num_runs = get_varlong(buf)?;
        let mut runs = Vec::with_capacity(num_runs.min(1024) as usize);
        let mut prev_end: Option<Seqno> = None;
        for _ in 0..num_runs {
            let start = Seqno::from_raw(get_varlong(buf)?);
            let len = get_varlong(buf)?;
            if len == 0 {
                bail!("seqno list run with zero length");
            }
            if let Some(prev) = prev_end {
                if start <= prev {
                    bail!("seqno list runs not ascending");
                }
            }
            prev_end = Some(start + (len - 1));
            runs.push((start, len));
        }
        Ok(SeqnoList { runs })
    }
}

impl Display for SeqnoList {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        for (i, &(start, len)) in self.runs.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            if len == 1 {
                write!(f, "{}", start)?;
            } else {
                write!(f, "{}-{}", start, start + (len - 1))?;
            }
        }
        Ok(())
    }
}
