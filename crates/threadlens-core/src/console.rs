//! Console input taken while the rest of the process is frozen

use std::io::{self, BufRead, Write};

use crate::freezer::Freezer;
use crate::platform::ThreadPlatform;
use crate::report::FreezeReport;
use crate::{Error, Result};

impl<P: ThreadPlatform> Freezer<P> {
    /// Write `prompt` to `output`, then read one line from `input`, with every
    /// other thread frozen.
    ///
    /// Returns the line without its terminator, or `None` at end of stream.
    /// On [`Error::ResumeIncomplete`] the line has already been consumed from
    /// `input` and is lost; [`Freezer::focus_read_line_with_report`] keeps it.
    pub fn focus_read_line<R, W>(
        &self,
        prompt: Option<&str>,
        input: &mut R,
        output: &mut W,
    ) -> Result<Option<String>>
    where
        R: BufRead,
        W: Write,
    {
        let (line, report) = self.focus_read_line_with_report(prompt, input, output)?;

        if report.is_degraded() {
            return Err(Error::ResumeIncomplete {
                failed: report.resume_failures().count(),
                suspended: report.suspended,
            });
        }

        Ok(line)
    }

    /// Like [`Freezer::focus_read_line`], but hands back the line together
    /// with the session report, even when some thread was not resumed.
    pub fn focus_read_line_with_report<R, W>(
        &self,
        prompt: Option<&str>,
        input: &mut R,
        output: &mut W,
    ) -> Result<(Option<String>, FreezeReport)>
    where
        R: BufRead,
        W: Write,
    {
        let (line, report) = self.focus_with_report(|| -> io::Result<Option<String>> {
            if let Some(prompt) = prompt {
                writeln!(output, "{}", prompt)?;
            }
            output.flush()?;

            let mut line = String::new();
            if input.read_line(&mut line)? == 0 {
                return Ok(None);
            }

            let trimmed = line.trim_end_matches(&['\n', '\r'][..]).len();
            line.truncate(trimmed);
            Ok(Some(line))
        })?;

        Ok((line?, report))
    }
}

/// Prompt on stdout and read one line from stdin while every other thread of
/// the process is frozen.
///
/// Both streams are locked before freezing, so a frozen thread can never be
/// holding them while the prompt is written.
pub fn focus_console_input(prompt: Option<&str>) -> Result<Option<String>> {
    let freezer = Freezer::new()?;
    let stdin = io::stdin();
    let stdout = io::stdout();
    let mut input = stdin.lock();
    let mut output = stdout.lock();

    freezer.focus_read_line(prompt, &mut input, &mut output)
}
