//! In-memory storage backend
//!
//! All three stores share one state behind a single mutex, so the combined
//! loan and counter writes of a circulation transaction are applied together
//! or not at all.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard},
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use regex::{Regex, RegexBuilder};
use uuid::Uuid;

use super::{BooksStore, LoansStore, MembersStore};
use crate::{
    error::{AppError, AppResult, Entity},
    models::{
        paginate, Book, BookQuery, BookStats, InventoryRow, Loan, LoanDetails, LoanQuery, LoanStats,
        LoanStatus, Member, MemberQuery,
    },
};

#[derive(Default)]
struct MemoryState {
    books: HashMap<Uuid, Book>,
    members: HashMap<Uuid, Member>,
    loans: HashMap<Uuid, Loan>,
}

impl MemoryState {
    fn book(&self, id: Uuid) -> AppResult<&Book> {
        self.books.get(&id).ok_or_else(|| AppError::not_found(Entity::Book, id))
    }

    fn active_loans<'a>(&'a self, book_id: Uuid) -> impl Iterator<Item = &'a Loan> + 'a {
        self.loans
            .values()
            .filter(move |l| l.book_id == book_id && l.is_active())
    }

    fn details(&self, loan: &Loan) -> LoanDetails {
        let book = self.books.get(&loan.book_id);
        let member = self.members.get(&loan.member_id);
        LoanDetails {
            id: loan.id,
            book_id: loan.book_id,
            member_id: loan.member_id,
            issued_at: loan.issued_at,
            returned_at: loan.returned_at,
            status: loan.status,
            issued_by: loan.issued_by,
            book_title: book.map(|b| b.title.clone()),
            book_author: book.map(|b| b.author.clone()),
            book_isbn: book.map(|b| b.isbn.clone()),
            member_name: member.map(|m| m.name.clone()),
            member_email: member.map(|m| m.email.clone()),
        }
    }
}

/// Shared in-memory state implementing every store trait
#[derive(Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> AppResult<MutexGuard<'_, MemoryState>> {
        self.state
            .lock()
            .map_err(|_| AppError::Internal("In-memory store lock poisoned".to_string()))
    }

    /// Overwrite a book's available counter without touching the ledger
    #[cfg(test)]
    pub(crate) fn corrupt_available_copies(&self, book_id: Uuid, available_copies: i32) {
        let mut state = self.state.lock().unwrap();
        state.books.get_mut(&book_id).unwrap().available_copies = available_copies;
    }
}

/// Case-insensitive literal matcher, mirroring `ILIKE '%term%'`
fn matcher(term: Option<&str>) -> AppResult<Option<Regex>> {
    term.map(|t| {
        RegexBuilder::new(&regex::escape(t))
            .case_insensitive(true)
            .build()
            .map_err(|e| AppError::BadRequest(format!("Invalid search term: {}", e)))
    })
    .transpose()
}

fn page<T>(rows: Vec<T>, page: Option<i64>, per_page: Option<i64>) -> (Vec<T>, i64) {
    let total = rows.len() as i64;
    let (_, per_page, offset) = paginate(page, per_page);
    let rows = rows
        .into_iter()
        .skip(offset as usize)
        .take(per_page as usize)
        .collect();
    (rows, total)
}

#[async_trait]
impl BooksStore for MemoryStore {
    async fn create(&self, book: &Book) -> AppResult<Book> {
        let mut state = self.state()?;
        if state.books.values().any(|b| b.isbn == book.isbn) {
            return Err(AppError::Conflict("A book with this ISBN already exists".to_string()));
        }
        state.books.insert(book.id, book.clone());
        Ok(book.clone())
    }

    async fn get(&self, id: Uuid) -> AppResult<Book> {
        self.state()?.book(id).cloned()
    }

    async fn search(&self, query: &BookQuery) -> AppResult<(Vec<Book>, i64)> {
        let search = matcher(query.search.as_deref())?;
        let category = matcher(query.category.as_deref())?;
        let state = self.state()?;

        let mut books: Vec<Book> = state
            .books
            .values()
            .filter(|b| {
                search.as_ref().map_or(true, |re| {
                    re.is_match(&b.title) || re.is_match(&b.author) || re.is_match(&b.category)
                })
            })
            .filter(|b| category.as_ref().map_or(true, |re| re.is_match(&b.category)))
            .cloned()
            .collect();
        books.sort_by(|a, b| b.created_at.cmp(&a.created_at));

        Ok(page(books, query.page, query.per_page))
    }

    async fn update(&self, book: &Book, expected_available: i32) -> AppResult<Book> {
        let mut state = self.state()?;
        if state.books.values().any(|b| b.isbn == book.isbn && b.id != book.id) {
            return Err(AppError::Conflict("A book with this ISBN already exists".to_string()));
        }
        if book.available_copies < 0 || book.available_copies > book.total_copies {
            return Err(AppError::InvariantViolation(format!(
                "book {} cannot hold {} available of {} copies",
                book.id, book.available_copies, book.total_copies
            )));
        }
        let stored = state
            .books
            .get_mut(&book.id)
            .ok_or_else(|| AppError::not_found(Entity::Book, book.id))?;
        if stored.available_copies != expected_available {
            return Err(AppError::Busy(format!(
                "Copies of book {} changed concurrently",
                book.id
            )));
        }
        stored.title = book.title.clone();
        stored.author = book.author.clone();
        stored.isbn = book.isbn.clone();
        stored.category = book.category.clone();
        stored.total_copies = book.total_copies;
        stored.available_copies = book.available_copies;
        Ok(stored.clone())
    }

    async fn delete(&self, id: Uuid) -> AppResult<()> {
        let mut state = self.state()?;
        state.book(id)?;
        let active = state.active_loans(id).count();
        if active > 0 {
            return Err(AppError::Conflict(format!(
                "Book has {} active loan(s) and cannot be withdrawn",
                active
            )));
        }
        state.books.remove(&id);
        Ok(())
    }

    async fn stats(&self) -> AppResult<BookStats> {
        let state = self.state()?;
        Ok(BookStats {
            total_books: state.books.len() as i64,
            total_copies: state.books.values().map(|b| i64::from(b.total_copies)).sum(),
            available_copies: state.books.values().map(|b| i64::from(b.available_copies)).sum(),
        })
    }
}

#[async_trait]
impl MembersStore for MemoryStore {
    async fn create(&self, member: &Member) -> AppResult<Member> {
        let mut state = self.state()?;
        if state.members.values().any(|m| m.email == member.email) {
            return Err(AppError::Conflict("A member with this email already exists".to_string()));
        }
        state.members.insert(member.id, member.clone());
        Ok(member.clone())
    }

    async fn get(&self, id: Uuid) -> AppResult<Member> {
        self.state()?
            .members
            .get(&id)
            .cloned()
            .ok_or_else(|| AppError::not_found(Entity::Member, id))
    }

    async fn search(&self, query: &MemberQuery) -> AppResult<(Vec<Member>, i64)> {
        let search = matcher(query.search.as_deref())?;
        let state = self.state()?;

        let mut members: Vec<Member> = state
            .members
            .values()
            .filter(|m| {
                search.as_ref().map_or(true, |re| {
                    re.is_match(&m.name) || re.is_match(&m.email) || re.is_match(&m.phone)
                })
            })
            .cloned()
            .collect();
        members.sort_by(|a, b| b.membership_date.cmp(&a.membership_date));

        Ok(page(members, query.page, query.per_page))
    }

    async fn update(&self, member: &Member) -> AppResult<Member> {
        let mut state = self.state()?;
        if state.members.values().any(|m| m.email == member.email && m.id != member.id) {
            return Err(AppError::Conflict("A member with this email already exists".to_string()));
        }
        let stored = state
            .members
            .get_mut(&member.id)
            .ok_or_else(|| AppError::not_found(Entity::Member, member.id))?;
        *stored = member.clone();
        Ok(stored.clone())
    }

    async fn delete(&self, id: Uuid) -> AppResult<()> {
        let mut state = self.state()?;
        if !state.members.contains_key(&id) {
            return Err(AppError::not_found(Entity::Member, id));
        }
        let active = state
            .loans
            .values()
            .filter(|l| l.member_id == id && l.is_active())
            .count();
        if active > 0 {
            return Err(AppError::Conflict(format!(
                "Member holds {} active loan(s) and cannot be removed",
                active
            )));
        }
        state.members.remove(&id);
        Ok(())
    }
}

#[async_trait]
impl LoansStore for MemoryStore {
    async fn get(&self, id: Uuid) -> AppResult<Loan> {
        self.state()?
            .loans
            .get(&id)
            .cloned()
            .ok_or_else(|| AppError::not_found(Entity::Loan, id))
    }

    async fn find_active(&self, book_id: Uuid, member_id: Uuid) -> AppResult<Option<Loan>> {
        let state = self.state()?;
        let loan = state.active_loans(book_id).find(|l| l.member_id == member_id).cloned();
        Ok(loan)
    }

    async fn count_active_for_book(&self, book_id: Uuid) -> AppResult<i64> {
        Ok(self.state()?.active_loans(book_id).count() as i64)
    }

    async fn commit_issue(&self, loan: &Loan, expected_available: i32) -> AppResult<Book> {
        let mut state = self.state()?;

        if !state.members.contains_key(&loan.member_id) {
            return Err(AppError::not_found(Entity::Member, loan.member_id));
        }
        let book = state.book(loan.book_id)?;
        if book.available_copies != expected_available || book.available_copies <= 0 {
            return Err(AppError::Busy(format!(
                "Copies of book {} changed concurrently",
                loan.book_id
            )));
        }
        if state.active_loans(loan.book_id).any(|l| l.member_id == loan.member_id) {
            return Err(AppError::DuplicateLoan);
        }

        state.loans.insert(loan.id, loan.clone());
        let book = state
            .books
            .get_mut(&loan.book_id)
            .ok_or_else(|| AppError::not_found(Entity::Book, loan.book_id))?;
        book.available_copies -= 1;
        Ok(book.clone())
    }

    async fn commit_return(
        &self,
        loan: &Loan,
        returned_at: DateTime<Utc>,
        expected_available: i32,
    ) -> AppResult<(Loan, Book)> {
        let mut state = self.state()?;

        let stored = state
            .loans
            .get(&loan.id)
            .ok_or_else(|| AppError::not_found(Entity::Loan, loan.id))?;
        let returned = stored.returned(returned_at).ok_or(AppError::AlreadyReturned)?;

        let book = state.books.get(&loan.book_id).ok_or_else(|| {
            AppError::InvariantViolation(format!(
                "active loan {} references missing book {}",
                loan.id, loan.book_id
            ))
        })?;
        if book.available_copies >= book.total_copies {
            return Err(AppError::InvariantViolation(format!(
                "returning loan {} would raise book {} above {} copies",
                loan.id, book.id, book.total_copies
            )));
        }
        if book.available_copies != expected_available {
            return Err(AppError::Busy(format!("Copies of book {} changed concurrently", book.id)));
        }

        state.loans.insert(returned.id, returned.clone());
        let book = state
            .books
            .get_mut(&loan.book_id)
            .ok_or_else(|| AppError::not_found(Entity::Book, loan.book_id))?;
        book.available_copies += 1;
        Ok((returned, book.clone()))
    }

    async fn search(&self, query: &LoanQuery) -> AppResult<(Vec<LoanDetails>, i64)> {
        let state = self.state()?;

        let mut loans: Vec<&Loan> = state
            .loans
            .values()
            .filter(|l| query.status.map_or(true, |s| l.status == s))
            .filter(|l| query.member_id.map_or(true, |id| l.member_id == id))
            .filter(|l| query.book_id.map_or(true, |id| l.book_id == id))
            .collect();
        loans.sort_by(|a, b| b.issued_at.cmp(&a.issued_at));

        let details = loans.into_iter().map(|l| state.details(l)).collect();
        Ok(page(details, query.page, query.per_page))
    }

    async fn details(&self, id: Uuid) -> AppResult<LoanDetails> {
        let state = self.state()?;
        let loan = state
            .loans
            .get(&id)
            .ok_or_else(|| AppError::not_found(Entity::Loan, id))?;
        Ok(state.details(loan))
    }

    async fn delete_returned(&self, id: Uuid) -> AppResult<()> {
        let mut state = self.state()?;
        let loan = state
            .loans
            .get(&id)
            .ok_or_else(|| AppError::not_found(Entity::Loan, id))?;
        if loan.is_active() {
            return Err(AppError::Conflict(
                "An active loan cannot be purged; return it first".to_string(),
            ));
        }
        state.loans.remove(&id);
        Ok(())
    }

    async fn stats(&self) -> AppResult<LoanStats> {
        let state = self.state()?;

        let total_active = state.loans.values().filter(|l| l.is_active()).count() as i64;
        let total_returned = state
            .loans
            .values()
            .filter(|l| l.status == LoanStatus::Returned)
            .count() as i64;

        let mut active: Vec<&Loan> = state.loans.values().filter(|l| l.is_active()).collect();
        active.sort_by(|a, b| b.issued_at.cmp(&a.issued_at));
        let recent_active = active.into_iter().take(5).map(|l| state.details(l)).collect();

        Ok(LoanStats {
            total_active,
            total_returned,
            recent_active,
        })
    }

    async fn inventory(&self) -> AppResult<Vec<InventoryRow>> {
        let state = self.state()?;
        let mut rows: Vec<InventoryRow> = state
            .books
            .values()
            .map(|b| InventoryRow {
                book_id: b.id,
                title: b.title.clone(),
                total_copies: b.total_copies,
                available_copies: b.available_copies,
                active_loans: state.active_loans(b.id).count() as i64,
            })
            .collect();
        rows.sort_by(|a, b| a.title.cmp(&b.title));
        Ok(rows)
    }
}
